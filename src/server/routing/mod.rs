//! Destination number routing
//!
//! Maps a dialed number to the endpoints that should ring for it. The table is
//! built once at startup and shared read-only by every call session.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder replaced by the raw destination number in reject reasons
pub const NUMBER_PLACEHOLDER: &str = "{number}";

/// Reject reason used when no template is configured
pub const DEFAULT_REJECT_TEMPLATE: &str = "No route found for {number}";

/// Digits in a subscriber number without the country code
const SUBSCRIBER_NUMBER_LEN: usize = 10;

/// Country code stripped from 11-digit numbers
const COUNTRY_CODE: char = '1';

/// Routing table errors (load time only, deciding never fails)
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Failed to read routes file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid routes file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Route {0} has no targets")]
    EmptyTargets(String),

    #[error("Route {0} has no numbers")]
    NoNumbers(String),

    #[error("Route {route} has a number that normalizes to nothing: {number:?}")]
    EmptyNumber { route: String, number: String },

    #[error("Number {number} is claimed by both {first} and {second}")]
    DuplicateNumber {
        number: String,
        first: String,
        second: String,
    },
}

/// Outcome of a routing lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Ring these endpoints, in order, within the given signaling domain
    Bridge { targets: Vec<String>, domain: String },
    /// Refuse the call with this hangup reason
    Reject { reason: String },
}

impl Decision {
    pub fn action(&self) -> &'static str {
        match self {
            Decision::Bridge { .. } => "bridge",
            Decision::Reject { .. } => "reject",
        }
    }

    /// A bridge with nothing to ring is a reject
    pub fn into_dialable(self, destination_number: &str) -> Decision {
        match self {
            Decision::Bridge { targets, .. } if targets.is_empty() => Decision::Reject {
                reason: format!("No targets configured for {}", destination_number),
            },
            other => other,
        }
    }
}

/// One store's entry in the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Name used in logs
    pub name: String,
    /// Numbers that reach this route, in any recognized form
    pub numbers: Vec<String>,
    /// Endpoint addresses, rung in order
    pub targets: Vec<String>,
    /// Signaling domain of the targets
    pub domain: String,
    /// Dialplan context of the store
    #[serde(default)]
    pub context: String,
}

impl Route {
    fn store(name: &str, number: &str, domain: &str) -> Self {
        Self {
            name: name.to_string(),
            numbers: vec![number.to_string()],
            targets: vec![
                format!("user/1000@{}", domain),
                format!("user/1001@{}", domain),
            ],
            domain: domain.to_string(),
            context: name.to_string(),
        }
    }
}

/// Serialized form of the routing table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_reject_template")]
    pub reject_template: String,
    pub routes: Vec<Route>,
}

fn default_reject_template() -> String {
    DEFAULT_REJECT_TEMPLATE.to_string()
}

/// Normalized-number lookup table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
    /// Normalized number -> index into `routes`
    index: HashMap<String, usize>,
    reject_template: String,
}

impl RoutingTable {
    /// Build a table, rejecting routes that could never produce a usable bridge
    pub fn new(config: RoutingConfig) -> Result<Self, RoutingError> {
        let mut index: HashMap<String, usize> = HashMap::new();

        for (i, route) in config.routes.iter().enumerate() {
            if route.targets.is_empty() {
                return Err(RoutingError::EmptyTargets(route.name.clone()));
            }
            if route.numbers.is_empty() {
                return Err(RoutingError::NoNumbers(route.name.clone()));
            }
            for number in &route.numbers {
                let key = normalize_number(number);
                if key.is_empty() {
                    return Err(RoutingError::EmptyNumber {
                        route: route.name.clone(),
                        number: number.clone(),
                    });
                }
                if let Some(&existing) = index.get(&key) {
                    if existing != i {
                        return Err(RoutingError::DuplicateNumber {
                            number: key,
                            first: config.routes[existing].name.clone(),
                            second: route.name.clone(),
                        });
                    }
                }
                index.insert(key, i);
            }
        }

        Ok(Self {
            routes: config.routes,
            index,
            reject_template: config.reject_template,
        })
    }

    /// The two stores served out of the box
    pub fn builtin() -> Self {
        let routes = vec![
            Route::store("store1", "17577828734", "store1.local"),
            Route::store("store2", "7372449688", "store2.local"),
        ];
        let index = routes
            .iter()
            .enumerate()
            .flat_map(|(i, route)| route.numbers.iter().map(move |n| (normalize_number(n), i)))
            .collect();

        Self {
            routes,
            index,
            reject_template: default_reject_template(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RoutingError> {
        let config: RoutingConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| RoutingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Route a dialed number reaches, if any
    pub fn lookup(&self, destination_number: &str) -> Option<&Route> {
        let key = normalize_number(destination_number);
        self.index.get(&key).map(|&i| &self.routes[i])
    }

    /// Decide what to do with a call. Total and side-effect free.
    pub fn decide(&self, destination_number: &str, _caller_number: &str) -> Decision {
        match self.lookup(destination_number) {
            Some(route) => Decision::Bridge {
                targets: route.targets.clone(),
                domain: route.domain.clone(),
            },
            None => Decision::Reject {
                reason: self.reject_template.replace(NUMBER_PLACEHOLDER, destination_number),
            },
        }
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Reduce a dialed number to its 10-digit subscriber form.
///
/// Hyphens, spaces and `+` are removed, then a leading `1` is dropped when
/// what remains is a full subscriber number. Applying it twice changes nothing.
pub fn normalize_number(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '+'))
        .collect();

    match stripped.strip_prefix(COUNTRY_CODE) {
        Some(rest) if rest.len() == SUBSCRIBER_NUMBER_LEN => rest.to_string(),
        _ => stripped,
    }
}

use serde::Serialize;
use std::sync::Mutex;

/// Digits only: `+44 (20) 1234-5678` -> `442012345678`.
pub fn normalize_number(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhoneRoute {
    pub number: String,
    pub destination: String,
}

/// Phone number to routing destination table, consulted on every INVITE.
///
/// Routes keep insertion order, so the suffix scan is deterministic:
/// the first configured route that overlaps wins.
#[derive(Debug, Default)]
pub struct PhoneRouteTable {
    routes: Mutex<Vec<PhoneRoute>>,
}

impl PhoneRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes<I, K, V>(routes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let table = Self::new();
        for (number, destination) in routes {
            table.set(number, destination);
        }
        table
    }

    pub fn set(&self, number: impl Into<String>, destination: impl Into<String>) {
        let number = number.into();
        let destination = destination.into();
        let mut routes = self.lock();
        match routes.iter_mut().find(|r| r.number == number) {
            Some(route) => route.destination = destination,
            None => routes.push(PhoneRoute {
                number,
                destination,
            }),
        }
    }

    /// Add a route unless `number` already has one. Returns whether it was added.
    pub fn set_if_absent(&self, number: impl Into<String>, destination: impl Into<String>) -> bool {
        let number = number.into();
        let mut routes = self.lock();
        if routes.iter().any(|r| r.number == number) {
            return false;
        }
        routes.push(PhoneRoute {
            number,
            destination: destination.into(),
        });
        true
    }

    pub fn remove(&self, number: &str) -> Option<String> {
        let mut routes = self.lock();
        let idx = routes.iter().position(|r| r.number == number)?;
        Some(routes.remove(idx).destination)
    }

    pub fn list(&self) -> Vec<PhoneRoute> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve a destination for an inbound call.
    ///
    /// Candidates are tried against the table in three passes: exact match,
    /// digit-normalized match, then a suffix overlap in either direction.
    pub fn resolve(&self, candidates: &[&str]) -> Option<String> {
        let candidates: Vec<&str> = candidates
            .iter()
            .copied()
            .filter(|c| !c.is_empty())
            .collect();
        let routes = self.lock();

        for candidate in &candidates {
            if let Some(route) = routes.iter().find(|r| r.number == *candidate) {
                return Some(route.destination.clone());
            }
        }

        let normalized: Vec<String> = candidates
            .iter()
            .map(|c| normalize_number(c))
            .filter(|c| !c.is_empty())
            .collect();
        for candidate in &normalized {
            if let Some(route) = routes
                .iter()
                .find(|r| normalize_number(&r.number) == *candidate)
            {
                return Some(route.destination.clone());
            }
        }

        routes
            .iter()
            .find(|route| {
                let key = normalize_number(&route.number);
                !key.is_empty()
                    && normalized
                        .iter()
                        .any(|c| key.ends_with(c.as_str()) || c.ends_with(key.as_str()))
            })
            .map(|route| route.destination.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PhoneRoute>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Delimiter joining the components of a serialized key.
pub const KEY_DELIMITER: char = '|';

/// Delimiter joining the columns of an output row.
pub const ROW_DELIMITER: char = ',';

/// Number of components in a serialized key.
pub const KEY_PARTS: usize = 4;

/// Errors produced when building or parsing an [`AggregationKey`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{component} contains reserved delimiter: {value:?}")]
    ReservedDelimiter {
        component: &'static str,
        value: String,
    },

    #[error("expected 4 key parts, found {found}")]
    PartCount { found: usize },

    #[error("invalid key second: {value:?}")]
    InvalidSecond { value: String },
}

/// Identity of one statistics bucket.
///
/// Ordering compares the second first, so an ordered map of keys iterates in
/// time order and every key of a given second is contiguous.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregationKey {
    second: u64,
    run_id: Arc<str>,
    machine_id: Arc<str>,
    scenario: Arc<str>,
}

impl AggregationKey {
    /// Build a key, rejecting components that would not survive serialization.
    pub fn new(
        run_id: Arc<str>,
        machine_id: Arc<str>,
        scenario: Arc<str>,
        second: u64,
    ) -> Result<Self, KeyError> {
        check_component("run_id", &run_id)?;
        check_component("machine_id", &machine_id)?;
        check_component("scenario", &scenario)?;

        Ok(Self {
            second,
            run_id,
            machine_id,
            scenario,
        })
    }

    /// Smallest key of the given second. Used as a range bound only.
    pub(crate) fn floor(second: u64) -> Self {
        let empty: Arc<str> = Arc::from("");
        Self {
            second,
            run_id: Arc::clone(&empty),
            machine_id: Arc::clone(&empty),
            scenario: empty,
        }
    }

    /// Parse a serialized `run|machine|scenario|second` key.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = s.split(KEY_DELIMITER).collect();
        if parts.len() != KEY_PARTS {
            return Err(KeyError::PartCount { found: parts.len() });
        }

        let second = parts[3].parse().map_err(|_| KeyError::InvalidSecond {
            value: parts[3].to_string(),
        })?;

        Self::new(
            Arc::from(parts[0]),
            Arc::from(parts[1]),
            Arc::from(parts[2]),
            second,
        )
    }

    pub fn second(&self) -> u64 {
        self.second
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_DELIMITER}{}{KEY_DELIMITER}{}{KEY_DELIMITER}{}",
            self.run_id, self.machine_id, self.scenario, self.second
        )
    }
}

fn check_component(component: &'static str, value: &str) -> Result<(), KeyError> {
    if value.contains([KEY_DELIMITER, ROW_DELIMITER]) {
        return Err(KeyError::ReservedDelimiter {
            component,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Returns true if `value` can be used verbatim as a key component.
pub fn is_valid_component(value: &str) -> bool {
    check_component("", value).is_ok()
}

/// Derives keys for one aggregator: the run id is fixed, the machine id is
/// supplied per call (it may still be the unresolved sentinel).
///
/// Scenario labels are interned so a steady stream of samples for the same
/// scenario shares one allocation. Labels no live key refers to are released
/// by [`KeyBuilder::prune`].
pub struct KeyBuilder {
    run_id: Arc<str>,
    scenarios: parking_lot::Mutex<HashSet<Arc<str>>>,
}

impl KeyBuilder {
    pub fn new(run_id: &str) -> Result<Self, KeyError> {
        check_component("run_id", run_id)?;
        Ok(Self {
            run_id: Arc::from(run_id),
            scenarios: parking_lot::Mutex::new(HashSet::with_capacity(16)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Build the key for a sample of `scenario` taken at `timestamp_ms`.
    pub fn build(
        &self,
        machine_id: &Arc<str>,
        scenario: &str,
        timestamp_ms: u64,
    ) -> Result<AggregationKey, KeyError> {
        check_component("scenario", scenario)?;
        let scenario = self.intern(scenario);
        AggregationKey::new(
            Arc::clone(&self.run_id),
            Arc::clone(machine_id),
            scenario,
            timestamp_ms / 1000,
        )
    }

    fn intern(&self, scenario: &str) -> Arc<str> {
        let mut scenarios = self.scenarios.lock();
        if let Some(existing) = scenarios.get(scenario) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(scenario);
        scenarios.insert(Arc::clone(&interned));
        interned
    }

    /// Forget labels that only the interner still holds. Returns how many
    /// were released.
    pub fn prune(&self) -> usize {
        let mut scenarios = self.scenarios.lock();
        let before = scenarios.len();
        scenarios.retain(|s| Arc::strong_count(s) > 1);
        before - scenarios.len()
    }

    /// Number of interned scenario labels.
    pub fn interned(&self) -> usize {
        self.scenarios.lock().len()
    }
}

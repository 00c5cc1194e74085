//! # Recovery Strategies
//!
//! A [`RecoveryStrategy`] describes how errors of a set of categories are
//! handled; the [`StrategyResolver`] maps a category to exactly one strategy,
//! falling back to a built-in default so resolution never fails.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::{ErrorCategory, RecoveryAction};

/// Upper bound for exponential backoff growth
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Strategy returned for categories nothing else claims
static DEFAULT_STRATEGY: Lazy<RecoveryStrategy> = Lazy::new(|| RecoveryStrategy {
    name: "default".to_string(),
    categories: Vec::new(),
    automatic_actions: Vec::new(),
    max_retries: 0,
    retry_delay: Duration::ZERO,
    use_exponential_backoff: false,
    max_delay: DEFAULT_MAX_DELAY,
    jitter_factor: 0.0,
    suggested_user_actions: vec![RecoveryAction::Contact],
    fallback: None,
});

/// How a set of error categories should be recovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    /// Name used in logs and validation errors
    pub name: String,
    /// Categories this strategy applies to
    pub categories: Vec<ErrorCategory>,
    /// Actions to attempt automatically, in order
    #[serde(default)]
    pub automatic_actions: Vec<RecoveryAction>,
    /// Attempt budget per retryable action; 0 disables automation entirely
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before the first attempt
    #[serde(with = "duration_ms", rename = "retry_delay_ms", default)]
    pub retry_delay: Duration,
    /// Double the delay after every failed attempt
    #[serde(default)]
    pub use_exponential_backoff: bool,
    /// Ceiling for the per-attempt delay
    #[serde(with = "duration_ms", rename = "max_delay_ms", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Random spread applied to each delay (0.0 - 1.0)
    #[serde(default)]
    pub jitter_factor: f64,
    /// What to suggest to the user when automation does not resolve the error
    #[serde(default)]
    pub suggested_user_actions: Vec<RecoveryAction>,
    /// Requested once after every automatic action failed
    #[serde(default)]
    pub fallback: Option<RecoveryAction>,
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

impl RecoveryStrategy {
    /// Creates a strategy with no automatic actions for the given categories
    pub fn new<S: Into<String>>(
        name: S,
        categories: impl IntoIterator<Item = ErrorCategory>,
    ) -> Self {
        Self {
            name: name.into(),
            categories: categories.into_iter().collect(),
            automatic_actions: Vec::new(),
            max_retries: 0,
            retry_delay: Duration::ZERO,
            use_exponential_backoff: false,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: 0.0,
            suggested_user_actions: Vec::new(),
            fallback: None,
        }
    }

    /// The built-in strategy: nothing automatic, suggest contacting support
    pub fn default_strategy() -> &'static RecoveryStrategy {
        &DEFAULT_STRATEGY
    }

    /// Sets the automatic actions
    pub fn automatic(mut self, actions: impl IntoIterator<Item = RecoveryAction>) -> Self {
        self.automatic_actions = actions.into_iter().collect();
        self
    }

    /// Sets the retry budget and base delay
    pub fn retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Enables exponential backoff capped at `max_delay`
    pub fn exponential(mut self, max_delay: Duration) -> Self {
        self.use_exponential_backoff = true;
        self.max_delay = max_delay;
        self
    }

    /// Sets the jitter factor
    pub fn jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Sets the actions suggested to the user
    pub fn suggest(mut self, actions: impl IntoIterator<Item = RecoveryAction>) -> Self {
        self.suggested_user_actions = actions.into_iter().collect();
        self
    }

    /// Sets the fallback action
    pub fn fallback(mut self, action: RecoveryAction) -> Self {
        self.fallback = Some(action);
        self
    }

    pub fn covers(&self, category: ErrorCategory) -> bool {
        self.categories.contains(&category)
    }

    /// Whether the executor may attempt anything automatically
    pub fn allows_automation(&self) -> bool {
        self.max_retries > 0 && !self.automatic_actions.is_empty()
    }

    /// Delay before the 0-based `attempt`, without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = if self.use_exponential_backoff {
            let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
            self.retry_delay.checked_mul(factor).unwrap_or(self.max_delay)
        } else {
            self.retry_delay
        };
        delay.min(self.max_delay)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidStrategy {
                name: self.name.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(EngineError::InvalidStrategy {
                name: self.name.clone(),
                reason: format!("jitter factor {} is outside 0.0..=1.0", self.jitter_factor),
            });
        }
        if self.categories.is_empty() {
            warn!(strategy = %self.name, "Strategy covers no categories and will never be used");
        }
        Ok(())
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecoveryStrategy({}, max_retries={}, backoff={})",
            self.name,
            self.max_retries,
            if self.use_exponential_backoff { "exponential" } else { "fixed" }
        )
    }
}

/// Category to strategy lookup
#[derive(Debug, Clone, Default)]
pub struct StrategyResolver {
    strategies: Vec<RecoveryStrategy>,
    by_category: HashMap<ErrorCategory, usize>,
}

impl StrategyResolver {
    /// Validates and registers `strategies` in order.
    ///
    /// Fails if two strategies claim the same category or a strategy has
    /// invalid settings.
    pub fn new(strategies: Vec<RecoveryStrategy>) -> Result<Self> {
        let mut by_category: HashMap<ErrorCategory, usize> = HashMap::new();

        for (index, strategy) in strategies.iter().enumerate() {
            strategy.validate()?;

            for category in &strategy.categories {
                if let Some(&existing) = by_category.get(category) {
                    if existing != index {
                        return Err(EngineError::AmbiguousStrategy {
                            category: *category,
                            first: strategies[existing].name.clone(),
                            second: strategy.name.clone(),
                        });
                    }
                } else {
                    by_category.insert(*category, index);
                }
            }
        }

        debug!(
            strategies = strategies.len(),
            covered = by_category.len(),
            "Recovery strategies registered"
        );

        Ok(Self {
            strategies,
            by_category,
        })
    }

    /// The strategies the exam application ships with
    pub fn with_defaults() -> Self {
        let strategies = builtin_strategies();
        let by_category = strategies
            .iter()
            .enumerate()
            .flat_map(|(index, strategy)| strategy.categories.iter().map(move |c| (*c, index)))
            .collect();
        Self {
            strategies,
            by_category,
        }
    }

    /// Returns the strategy for `category`; never fails
    pub fn resolve(&self, category: ErrorCategory) -> &RecoveryStrategy {
        match self.by_category.get(&category) {
            Some(&index) => &self.strategies[index],
            None => RecoveryStrategy::default_strategy(),
        }
    }

    pub fn strategies(&self) -> &[RecoveryStrategy] {
        &self.strategies
    }

    /// Categories that resolve to the built-in default
    pub fn uncovered(&self) -> Vec<ErrorCategory> {
        ErrorCategory::ALL
            .into_iter()
            .filter(|category| !self.by_category.contains_key(category))
            .collect()
    }
}

fn builtin_strategies() -> Vec<RecoveryStrategy> {
    vec![
        RecoveryStrategy::new("network", [ErrorCategory::Network])
            .automatic([RecoveryAction::Retry])
            .retries(3, Duration::from_millis(1000))
            .exponential(Duration::from_secs(10))
            .jitter(0.1)
            .suggest([RecoveryAction::Retry, RecoveryAction::Refresh]),
        RecoveryStrategy::new("storage", [ErrorCategory::Storage])
            .suggest([RecoveryAction::Export, RecoveryAction::Refresh])
            .fallback(RecoveryAction::Export),
        RecoveryStrategy::new("application", [ErrorCategory::Runtime, ErrorCategory::Ui])
            .suggest([RecoveryAction::Refresh, RecoveryAction::Contact]),
        RecoveryStrategy::new("validation", [ErrorCategory::Validation])
            .suggest([RecoveryAction::Ignore]),
        RecoveryStrategy::new("security", [ErrorCategory::Security])
            .suggest([RecoveryAction::Contact]),
        RecoveryStrategy::new("business", [ErrorCategory::Business])
            .automatic([RecoveryAction::Retry])
            .retries(1, Duration::from_millis(500))
            .suggest([RecoveryAction::Retry, RecoveryAction::Contact]),
        RecoveryStrategy::new(
            "environment",
            [ErrorCategory::Performance, ErrorCategory::Accessibility],
        )
        .suggest([RecoveryAction::Ignore]),
    ]
}

/// Serde adapter storing a [`Duration`] as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_is_total() {
        let resolvers = [
            StrategyResolver::default(),
            StrategyResolver::with_defaults(),
            StrategyResolver::new(vec![RecoveryStrategy::new("net", [ErrorCategory::Network])])
                .unwrap(),
        ];

        for resolver in &resolvers {
            for category in ErrorCategory::ALL {
                let strategy = resolver.resolve(category);
                assert!(!strategy.name.is_empty());
            }
        }
    }

    #[test]
    fn test_default_strategy_suggests_contact() {
        let resolver = StrategyResolver::default();
        let strategy = resolver.resolve(ErrorCategory::Compatibility);

        assert_eq!(strategy.name, "default");
        assert!(strategy.automatic_actions.is_empty());
        assert_eq!(strategy.max_retries, 0);
        assert_eq!(strategy.suggested_user_actions, vec![RecoveryAction::Contact]);
        assert!(strategy.fallback.is_none());
    }

    #[test]
    fn test_builtin_strategies_are_unambiguous() {
        let builtin = StrategyResolver::with_defaults();
        let validated = StrategyResolver::new(builtin.strategies().to_vec()).unwrap();

        assert_eq!(validated.uncovered(), vec![ErrorCategory::Compatibility]);
        assert_eq!(validated.resolve(ErrorCategory::Ui).name, "application");
        assert_eq!(validated.resolve(ErrorCategory::Network).max_retries, 3);
    }

    #[test]
    fn test_overlapping_categories_are_rejected() {
        let result = StrategyResolver::new(vec![
            RecoveryStrategy::new("network", [ErrorCategory::Network]),
            RecoveryStrategy::new("offline", [ErrorCategory::Storage, ErrorCategory::Network]),
        ]);

        match result {
            Err(EngineError::AmbiguousStrategy {
                category,
                first,
                second,
            }) => {
                assert_eq!(category, ErrorCategory::Network);
                assert_eq!(first, "network");
                assert_eq!(second, "offline");
            }
            other => panic!("expected ambiguity error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_jitter_is_rejected() {
        let result = StrategyResolver::new(vec![
            RecoveryStrategy::new("net", [ErrorCategory::Network]).jitter(1.5),
        ]);
        assert!(matches!(result, Err(EngineError::InvalidStrategy { .. })));
    }

    #[test]
    fn test_backoff_calculation() {
        let strategy = RecoveryStrategy::new("net", [ErrorCategory::Network])
            .automatic([RecoveryAction::Retry])
            .retries(3, Duration::from_millis(100))
            .exponential(DEFAULT_MAX_DELAY);

        let delays: Vec<_> = (0..strategy.max_retries)
            .map(|attempt| strategy.delay_for_attempt(attempt))
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let strategy = RecoveryStrategy::new("net", [ErrorCategory::Network])
            .retries(40, Duration::from_secs(1))
            .exponential(Duration::from_secs(30));

        assert_eq!(strategy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(strategy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(strategy.delay_for_attempt(39), Duration::from_secs(30));

        let fixed = RecoveryStrategy::new("fixed", [ErrorCategory::Business])
            .retries(3, Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(2), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_retries_disables_automation() {
        let strategy = RecoveryStrategy::new("net", [ErrorCategory::Network])
            .automatic([RecoveryAction::Retry, RecoveryAction::Refresh]);
        assert!(!strategy.allows_automation());
    }

    #[test]
    fn test_strategy_deserializes_from_json() {
        let strategy: RecoveryStrategy = serde_json::from_value(serde_json::json!({
            "name": "network",
            "categories": ["network"],
            "automatic_actions": ["retry"],
            "max_retries": 2,
            "retry_delay_ms": 250,
            "use_exponential_backoff": true,
            "suggested_user_actions": ["retry", "refresh"],
            "fallback": "refresh"
        }))
        .unwrap();

        assert_eq!(strategy.retry_delay, Duration::from_millis(250));
        assert_eq!(strategy.max_delay, DEFAULT_MAX_DELAY);
        assert_eq!(strategy.fallback, Some(RecoveryAction::Refresh));

        let unknown = serde_json::from_value::<RecoveryStrategy>(serde_json::json!({
            "name": "x",
            "categories": ["database"]
        }));
        assert!(unknown.is_err());
    }
}

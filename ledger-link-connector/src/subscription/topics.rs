#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kinds of notifications a subscriber wants for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SubscriptionTopics {
    pub state: bool,
    pub transactions: bool,
}

impl SubscriptionTopics {
    pub const NONE: Self = Self {
        state: false,
        transactions: false,
    };

    pub const ALL: Self = Self {
        state: true,
        transactions: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.state && !self.transactions
    }

    /// Applies a partial update; absent flags keep their current value.
    pub fn merge(self, update: TopicsUpdate) -> Self {
        Self {
            state: update.state.unwrap_or(self.state),
            transactions: update.transactions.unwrap_or(self.transactions),
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            state: self.state || other.state,
            transactions: self.transactions || other.transactions,
        }
    }
}

/// Partial topic change requested by a subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TopicsUpdate {
    #[cfg_attr(feature = "serde", serde(default))]
    pub state: Option<bool>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub transactions: Option<bool>,
}

impl TopicsUpdate {
    pub const CLEAR: Self = Self {
        state: Some(false),
        transactions: Some(false),
    };

    pub fn state(enabled: bool) -> Self {
        Self {
            state: Some(enabled),
            transactions: None,
        }
    }

    pub fn transactions(enabled: bool) -> Self {
        Self {
            state: None,
            transactions: Some(enabled),
        }
    }
}

impl From<SubscriptionTopics> for TopicsUpdate {
    fn from(topics: SubscriptionTopics) -> Self {
        Self {
            state: Some(topics.state),
            transactions: Some(topics.transactions),
        }
    }
}

/// Identity of a subscriber. Internal ids are allocated for message sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    Client,
    Internal(u32),
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::Client => f.write_str("client"),
            Subscriber::Internal(id) => write!(f, "internal#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_untouched_flags() {
        let topics = SubscriptionTopics {
            state: true,
            transactions: false,
        };
        let merged = topics.merge(TopicsUpdate::transactions(true));
        assert_eq!(merged, SubscriptionTopics::ALL);

        let cleared = merged.merge(TopicsUpdate::state(false));
        assert!(!cleared.state);
        assert!(cleared.transactions);
        assert!(cleared.merge(TopicsUpdate::CLEAR).is_empty());
    }

    #[test]
    fn union_is_flagwise_or() {
        let state = SubscriptionTopics {
            state: true,
            transactions: false,
        };
        let transactions = SubscriptionTopics {
            state: false,
            transactions: true,
        };
        assert_eq!(state.union(transactions), SubscriptionTopics::ALL);
        assert!(SubscriptionTopics::NONE.union(SubscriptionTopics::NONE).is_empty());
    }
}

//! Shared types for the queue engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype wrapper for token IDs (UUIDv7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Service identifier (assigned by the administrative collaborator)
    ServiceId
);
string_id!(
    /// Counter identifier
    CounterId
);
string_id!(
    /// Citizen reference (owned by the identity collaborator)
    CitizenId
);
string_id!(
    /// Staff reference
    StaffId
);

/// Priority class, declared from highest to lowest precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityClass {
    Emergency,
    Disabled,
    Senior,
    Normal,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 4] = [
        PriorityClass::Emergency,
        PriorityClass::Disabled,
        PriorityClass::Senior,
        PriorityClass::Normal,
    ];

    /// Scheduling weight. Higher weight is served first.
    #[inline]
    pub const fn weight(self) -> u32 {
        match self {
            PriorityClass::Emergency => 1000,
            PriorityClass::Disabled => 100,
            PriorityClass::Senior => 50,
            PriorityClass::Normal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Emergency => "emergency",
            PriorityClass::Disabled => "disabled",
            PriorityClass::Senior => "senior",
            PriorityClass::Normal => "normal",
        }
    }
}

impl std::str::FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emergency" => Ok(PriorityClass::Emergency),
            "disabled" => Ok(PriorityClass::Disabled),
            "senior" => Ok(PriorityClass::Senior),
            "normal" => Ok(PriorityClass::Normal),
            other => Err(format!("unknown priority class: {other}")),
        }
    }
}

/// Token status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Waiting,
    Called,
    Serving,
    Completed,
    NoShow,
    Cancelled,
}

impl TokenStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenStatus::Completed | TokenStatus::NoShow | TokenStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the token state machine
    pub fn can_transition_to(self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        matches!(
            (self, next),
            (Waiting, Called)
                | (Waiting, Cancelled)
                | (Called, Serving)
                | (Called, NoShow)
                | (Serving, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Waiting => "waiting",
            TokenStatus::Called => "called",
            TokenStatus::Serving => "serving",
            TokenStatus::Completed => "completed",
            TokenStatus::NoShow => "no_show",
            TokenStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work citizens queue for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    /// Average handling duration per token (minutes)
    pub avg_handle_minutes: u32,
    pub active: bool,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, name: &str, avg_handle_minutes: u32) -> Self {
        Self { id: id.into(), name: name.to_string(), avg_handle_minutes, active: true }
    }

    /// Label prefix: first three letters of the name, uppercased
    pub fn label_prefix(&self) -> String {
        let prefix: String =
            self.name.chars().filter(|c| c.is_alphabetic()).take(3).collect::<String>();
        if prefix.is_empty() {
            "SVC".to_string()
        } else {
            prefix.to_uppercase()
        }
    }
}

/// A serving position bound to one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: CounterId,
    /// Numeric label shown on the display board
    pub label: u32,
    pub service_id: ServiceId,
    pub active: bool,
    pub staff_id: Option<StaffId>,
    pub current_token: Option<TokenId>,
}

impl Counter {
    pub fn new(id: impl Into<CounterId>, label: u32, service_id: impl Into<ServiceId>) -> Self {
        Self {
            id: id.into(),
            label,
            service_id: service_id.into(),
            active: true,
            staff_id: None,
            current_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_weights_are_strictly_ordered() {
        let weights: Vec<u32> = PriorityClass::ALL.iter().map(|p| p.weight()).collect();
        assert!(weights.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(PriorityClass::Emergency.weight(), 1000);
        assert_eq!(PriorityClass::Normal.weight(), 1);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("SENIOR".parse::<PriorityClass>().unwrap(), PriorityClass::Senior);
        assert_eq!("disabled".parse::<PriorityClass>().unwrap(), PriorityClass::Disabled);
        assert!("vip".parse::<PriorityClass>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use TokenStatus::*;
        assert!(Waiting.can_transition_to(Called));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(Called.can_transition_to(Serving));
        assert!(Called.can_transition_to(NoShow));
        assert!(Serving.can_transition_to(Completed));

        assert!(!Waiting.can_transition_to(Serving));
        assert!(!Called.can_transition_to(Cancelled));
        assert!(!Serving.can_transition_to(NoShow));
        for terminal in [Completed, NoShow, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Waiting, Called, Serving, Completed, NoShow, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_label_prefix() {
        assert_eq!(Service::new("s1", "General Enquiries", 5).label_prefix(), "GEN");
        assert_eq!(Service::new("s2", "ID", 5).label_prefix(), "ID");
        assert_eq!(Service::new("s3", "42", 5).label_prefix(), "SVC");
        assert_eq!(Service::new("s4", "tax office", 5).label_prefix(), "TAX");
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&TokenStatus::NoShow).unwrap();
        assert_eq!(json, "\"NO_SHOW\"");
    }
}

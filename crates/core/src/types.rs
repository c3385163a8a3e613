use std::fmt;

use serde::{Serialize, Serializer};

/// Fixed enumeration whose members travel over the wire as strings.
///
/// Implementors list every member so the normalizer can match raw strings
/// against the value set without knowing the concrete type.
pub trait WireEnum: Copy + 'static {
    /// Name used to tag converted values, e.g. `"HypeTrainContributionMethod"`.
    const NAME: &'static str;

    fn members() -> &'static [Self];

    fn as_str(self) -> &'static str;

    /// Looks up the member whose wire value equals `value`.
    fn from_wire(value: &str) -> Option<Self> {
        Self::members()
            .iter()
            .copied()
            .find(|member| member.as_str() == value)
    }

    fn member(self) -> EnumMember {
        EnumMember {
            enumeration: Self::NAME,
            value: self.as_str(),
        }
    }
}

/// Type-erased enumeration member stored inside a normalized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumMember {
    pub enumeration: &'static str,
    pub value: &'static str,
}

impl EnumMember {
    /// Recovers the typed member when it belongs to `E`.
    pub fn to<E: WireEnum>(self) -> Option<E> {
        if self.enumeration != E::NAME {
            return None;
        }
        E::from_wire(self.value)
    }
}

impl fmt::Display for EnumMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.enumeration, self.value)
    }
}

impl Serialize for EnumMember {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.value)
    }
}

/// Valid hype train contribution types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HypeTrainContributionMethod {
    Bits,
    Subs,
    Unknown,
}

impl WireEnum for HypeTrainContributionMethod {
    const NAME: &'static str = "HypeTrainContributionMethod";

    fn members() -> &'static [Self] {
        &[Self::Bits, Self::Subs, Self::Unknown]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Bits => "BITS",
            Self::Subs => "SUBS",
            Self::Unknown => "",
        }
    }
}

/// Kind of credential a topic needs before it can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    User,
    App,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::User => "user",
            Self::App => "app",
        }
    }
}

pub const SCOPE_CHANNEL_READ_SUBSCRIPTIONS: &str = "channel:read:subscriptions";
pub const SCOPE_CHANNEL_READ_HYPE_TRAIN: &str = "channel:read:hype_train";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_wire_matches_members() {
        assert_eq!(
            HypeTrainContributionMethod::from_wire("BITS"),
            Some(HypeTrainContributionMethod::Bits)
        );
        assert_eq!(
            HypeTrainContributionMethod::from_wire(""),
            Some(HypeTrainContributionMethod::Unknown)
        );
        assert_eq!(HypeTrainContributionMethod::from_wire("CHEER"), None);
    }

    #[test]
    fn member_round_trips_to_typed_value() {
        let member = HypeTrainContributionMethod::Subs.member();
        assert_eq!(member.to_string(), "HypeTrainContributionMethod::SUBS");
        assert_eq!(
            member.to::<HypeTrainContributionMethod>(),
            Some(HypeTrainContributionMethod::Subs)
        );
    }

    #[test]
    fn member_of_other_enumeration_is_rejected() {
        let foreign = EnumMember {
            enumeration: "Other",
            value: "BITS",
        };
        assert_eq!(foreign.to::<HypeTrainContributionMethod>(), None);
    }
}

//! Session kinds and their scopes.

/// What a session token is allowed to do.
///
/// `Full` sessions are the normal authenticated context. `MfaChallenge`
/// sessions are minted after a correct password when a second factor is still
/// outstanding; they can only reach the MFA verification endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionKind {
    Full,
    MfaChallenge,
}

impl SessionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MfaChallenge => "mfa_challenge",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "full" => Some(Self::Full),
            "mfa_challenge" => Some(Self::MfaChallenge),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionKind;

    #[test]
    fn session_kind_round_trips() {
        assert_eq!(
            SessionKind::from_str(SessionKind::Full.as_str()),
            Some(SessionKind::Full)
        );
        assert_eq!(
            SessionKind::from_str(SessionKind::MfaChallenge.as_str()),
            Some(SessionKind::MfaChallenge)
        );
        assert_eq!(SessionKind::from_str("bogus"), None);
    }
}

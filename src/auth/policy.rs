//! Issuing policy: which subjects may receive tokens, for which channels

use crate::auth::tokens::TokenError;
use crate::channels::{Channel, ChannelPattern};
use std::collections::BTreeSet;
use tracing::warn;

/// Decides whether a token may be signed
#[derive(Debug, Clone)]
pub struct IssuePolicy {
    /// `None` accepts every subject
    subjects: Option<BTreeSet<String>>,
    channels: Vec<ChannelPattern>,
}

impl IssuePolicy {
    /// Sign anything for anyone
    ///
    /// Only suitable for local demos; every construction is logged.
    pub fn permissive() -> Self {
        warn!("Token issuing policy is permissive: any subject may connect and subscribe to any channel");
        Self {
            subjects: None,
            channels: vec![ChannelPattern::any()],
        }
    }

    /// Deny everything until subjects and channels are allowed explicitly
    pub fn restricted() -> Self {
        Self {
            subjects: Some(BTreeSet::new()),
            channels: Vec::new(),
        }
    }

    pub fn allow_subject(mut self, subject: impl Into<String>) -> Self {
        if let Some(subjects) = self.subjects.as_mut() {
            subjects.insert(subject.into());
        }
        self
    }

    pub fn allow_channels(mut self, pattern: ChannelPattern) -> Self {
        if !self.channels.contains(&pattern) {
            self.channels.push(pattern);
        }
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.subjects.is_none()
    }

    /// Check that `subject` may be issued a connection token
    pub fn check_subject(&self, subject: &str) -> Result<(), TokenError> {
        if subject.is_empty() && !self.is_permissive() {
            return Err(TokenError::Unauthorized("empty subject".to_string()));
        }

        match &self.subjects {
            Some(subjects) if !subjects.contains(subject) => Err(TokenError::Unauthorized(
                format!("subject '{}' is not allowed", subject),
            )),
            _ => Ok(()),
        }
    }

    /// Check that `subject` may be issued a subscription token for `channel`
    pub fn check_subscription(&self, subject: &str, channel: &str) -> Result<(), TokenError> {
        self.check_subject(subject)?;

        if self.is_permissive() {
            return Ok(());
        }

        let parsed = Channel::parse(channel).map_err(|e| {
            TokenError::Unauthorized(format!("channel '{}' is invalid: {}", channel, e))
        })?;

        if self.channels.iter().any(|p| p.matches(&parsed)) {
            Ok(())
        } else {
            Err(TokenError::Unauthorized(format!(
                "channel '{}' is not allowed for subject '{}'",
                channel, subject
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_policy() -> IssuePolicy {
        IssuePolicy::restricted()
            .allow_subject("42")
            .allow_channels(ChannelPattern::parse("training_logs").unwrap())
            .allow_channels(ChannelPattern::parse("training_logs.*").unwrap())
    }

    #[test]
    fn test_permissive_allows_everything() {
        let policy = IssuePolicy::permissive();
        assert!(policy.is_permissive());
        assert!(policy.check_subject("anyone").is_ok());
        assert!(policy.check_subject("").is_ok());
        assert!(policy.check_subscription("anyone", "whatever").is_ok());
        assert!(policy.check_subscription("anyone", "").is_ok());
    }

    #[test]
    fn test_restricted_denies_by_default() {
        let policy = IssuePolicy::restricted();
        assert!(!policy.is_permissive());
        assert!(matches!(
            policy.check_subject("42"),
            Err(TokenError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_subject_allow_list() {
        let policy = training_policy();
        assert!(policy.check_subject("42").is_ok());
        assert!(policy.check_subject("43").is_err());
        assert!(policy.check_subject("").is_err());
    }

    #[test]
    fn test_channel_patterns() {
        let policy = training_policy();
        assert!(policy.check_subscription("42", "training_logs").is_ok());
        assert!(policy.check_subscription("42", "training_logs.run-1").is_ok());
        assert!(policy.check_subscription("42", "eval_logs").is_err());
        assert!(policy.check_subscription("42", "").is_err());
        assert!(policy.check_subscription("43", "training_logs").is_err());
    }

    #[test]
    fn test_allow_channels_dedup() {
        let pattern = ChannelPattern::parse("training_logs").unwrap();
        let policy = IssuePolicy::restricted()
            .allow_channels(pattern.clone())
            .allow_channels(pattern);
        assert_eq!(policy.channels.len(), 1);
    }
}

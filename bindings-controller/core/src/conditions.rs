//! Status condition bookkeeping for bindings.

use bindings_controller_k8s_api::{BindingStatus, Condition, ConditionStatus};
use chrono::{DateTime, SecondsFormat, Utc};

pub const READY: &str = "Ready";

pub mod reasons {
    /// The subject resource (or every resource matching its selector) could
    /// not be found.
    pub const SUBJECT_MISSING: &str = "SubjectMissing";

    /// A subject could not be patched.
    pub const BINDING_FAILED: &str = "BindingFailed";

    pub const MALFORMED_SUBJECT: &str = "MalformedSubject";

    /// The binding is being deleted and its mutations are being undone.
    pub const FINALIZING: &str = "Finalizing";
}

/// The set of conditions a binding kind reports. Only the happy condition
/// is tracked; it is `True` when every subject has been bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConditionSet {
    happy: &'static str,
}

impl ConditionSet {
    pub const READY: Self = Self { happy: READY };

    pub fn happy(&self) -> &'static str {
        self.happy
    }

    /// Adds the happy condition as `Unknown` if it is not yet present.
    pub fn initialize(&self, status: &mut BindingStatus, now: DateTime<Utc>) {
        if status.condition(self.happy).is_none() {
            status.conditions.push(Condition {
                type_: self.happy.to_string(),
                status: ConditionStatus::Unknown,
                reason: None,
                message: None,
                last_transition_time: Some(timestamp(now)),
            });
        }
    }

    pub fn mark_true(&self, status: &mut BindingStatus, now: DateTime<Utc>) {
        self.set(status, ConditionStatus::True, None, None, now);
    }

    pub fn mark_false(
        &self,
        status: &mut BindingStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.set(
            status,
            ConditionStatus::False,
            Some(reason),
            Some(message.into()),
            now,
        );
    }

    pub fn mark_unknown(
        &self,
        status: &mut BindingStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.set(
            status,
            ConditionStatus::Unknown,
            Some(reason),
            Some(message.into()),
            now,
        );
    }

    pub fn is_true(&self, status: &BindingStatus) -> bool {
        status
            .condition(self.happy)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    fn set(
        &self,
        status: &mut BindingStatus,
        value: ConditionStatus,
        reason: Option<&str>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.map(str::to_string);
        match status.conditions.iter_mut().find(|c| c.type_ == self.happy) {
            Some(c) => {
                if c.status != value {
                    c.status = value;
                    c.last_transition_time = Some(timestamp(now));
                }
                c.reason = reason;
                c.message = message;
            }
            None => status.conditions.push(Condition {
                type_: self.happy.to_string(),
                status: value,
                reason,
                message,
                last_transition_time: Some(timestamp(now)),
            }),
        }
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn initialize_adds_unknown_once() {
        let set = ConditionSet::READY;
        let mut status = BindingStatus::default();
        set.initialize(&mut status, at(0));
        set.initialize(&mut status, at(10));
        assert_eq!(
            status.conditions,
            vec![Condition {
                type_: "Ready".to_string(),
                status: ConditionStatus::Unknown,
                reason: None,
                message: None,
                last_transition_time: Some("1970-01-01T00:00:00Z".to_string()),
            }]
        );
    }

    #[test]
    fn transition_time_changes_only_with_status() {
        let set = ConditionSet::READY;
        let mut status = BindingStatus::default();
        set.mark_false(&mut status, reasons::SUBJECT_MISSING, "gone", at(0));
        set.mark_false(&mut status, reasons::BINDING_FAILED, "denied", at(10));

        let c = status.condition(READY).expect("ready condition");
        assert_eq!(c.reason.as_deref(), Some(reasons::BINDING_FAILED));
        assert_eq!(c.message.as_deref(), Some("denied"));
        assert_eq!(
            c.last_transition_time.as_deref(),
            Some("1970-01-01T00:00:00Z")
        );

        set.mark_true(&mut status, at(20));
        let c = status.condition(READY).expect("ready condition");
        assert!(set.is_true(&status));
        assert_eq!(c.reason, None);
        assert_eq!(c.message, None);
        assert_eq!(
            c.last_transition_time.as_deref(),
            Some("1970-01-01T00:00:20Z")
        );
    }
}

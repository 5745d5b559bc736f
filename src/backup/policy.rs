//! Trigger policy: decides, per write event, whether a snapshot push is due.
//!
//! Ordinary writes batch up to a threshold; a small set of kinds is important
//! enough to push immediately; a periodic sweep catches whatever is pending.
//! Ordinary requests therefore never pay network latency — only every Nth
//! write or the sweep does.

use chrono::{DateTime, Utc};

/// Classification of a local store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Payment settlement; immediate push.
    StarPayment,
    /// A new bot was provisioned; immediate push.
    BotProvision,
    /// First registration of a user; immediate push.
    UserRegistration,
    /// Returning-user bookkeeping.
    UserActivity,
    /// Balance adjustment outside a settlement.
    LedgerAdjust,
    /// System settings change.
    SettingChange,
}

impl WriteKind {
    /// Kinds that bypass the batching threshold.
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            WriteKind::StarPayment | WriteKind::BotProvision | WriteKind::UserRegistration
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::StarPayment => "star_payment",
            WriteKind::BotProvision => "bot_provision",
            WriteKind::UserRegistration => "user_registration",
            WriteKind::UserActivity => "user_activity",
            WriteKind::LedgerAdjust => "ledger_adjust",
            WriteKind::SettingChange => "setting_change",
        }
    }
}

/// Ephemeral input to the policy; one per local mutation.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub kind: WriteKind,
    pub affected_rows: usize,
    pub actor: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

impl WriteEvent {
    pub fn new(kind: WriteKind, actor: Option<i64>, affected_rows: usize) -> Self {
        Self {
            kind,
            affected_rows,
            actor,
            occurred_at: Utc::now(),
        }
    }
}

/// Pending-write accounting. Mutated only under the backup lock; reset to
/// zero only on push success.
#[derive(Debug, Clone, Default)]
pub struct BackupCounterState {
    pub pending_count: u32,
    pub last_push_at: Option<DateTime<Utc>>,
}

/// What to do with one write event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    PushNow,
    Defer,
}

#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    pub threshold: u32,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self { threshold: 5 }
    }
}

impl TriggerPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    /// Evaluate one event against the counter. Increments `pending_count`
    /// for non-immediate kinds; the counter is only cleared by the caller on
    /// push success.
    pub fn evaluate(&self, event: &WriteEvent, state: &mut BackupCounterState) -> TriggerDecision {
        if event.kind.is_immediate() {
            return TriggerDecision::PushNow;
        }
        state.pending_count += 1;
        if state.pending_count >= self.threshold {
            TriggerDecision::PushNow
        } else {
            TriggerDecision::Defer
        }
    }

    /// Periodic sweep: push only when something is pending.
    pub fn evaluate_sweep(&self, state: &BackupCounterState) -> TriggerDecision {
        if state.pending_count > 0 {
            TriggerDecision::PushNow
        } else {
            TriggerDecision::Defer
        }
    }
}

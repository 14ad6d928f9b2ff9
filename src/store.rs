//! Append-only event journal.
//!
//! Every opportunity transition, order submission, fill, and kill-switch
//! flip is appended as one JSON line. A line append is the atomic unit; the
//! file replays in order for recovery and audit. A database backend can
//! replace this behind the same append/replay surface.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::types::{Action, Cents, FillEvent, OpportunityState, Side};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal parse at line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// One journaled fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    OpportunityTransition {
        opportunity_id: Uuid,
        from: OpportunityState,
        to: OpportunityState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        ts: DateTime<Utc>,
    },
    OrderSubmitted {
        opportunity_id: Uuid,
        leg_index: usize,
        attempt: u32,
        ticker: String,
        action: Action,
        side: Side,
        count: i64,
        limit_price_cents: Cents,
        client_order_id: String,
        ts: DateTime<Utc>,
    },
    OrderCancelled {
        order_id: String,
        ts: DateTime<Utc>,
    },
    Fill(FillEvent),
    KillSwitch {
        engaged: bool,
        reason: String,
        ts: DateTime<Utc>,
    },
}

/// Line-buffered JSONL journal. Appends are serialized; a failed write logs
/// and drops the line rather than stalling the trading path.
pub struct Journal {
    writer: Mutex<Option<File>>,
    path: Option<PathBuf>,
}

impl Journal {
    /// Open (or create) `journal.jsonl` under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join("journal.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Mutex::new(Some(file)),
            path: Some(path),
        })
    }

    /// A journal that records nothing. Tests and ephemeral runs.
    pub fn disabled() -> Self {
        Self {
            writer: Mutex::new(None),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event as a JSON line, flushed before the lock releases.
    pub fn append(&self, event: &JournalEvent) {
        let mut guard = self.writer.lock().expect("journal lock");
        let Some(file) = guard.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("journal serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
            warn!("journal append failed: {}", e);
        }
    }

    pub fn transition(
        &self,
        opportunity_id: Uuid,
        from: OpportunityState,
        to: OpportunityState,
        reason: Option<String>,
    ) {
        self.append(&JournalEvent::OpportunityTransition {
            opportunity_id,
            from,
            to,
            reason,
            ts: Utc::now(),
        });
    }

    /// Read a journal file back in order.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<JournalEvent>, JournalError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line)
                .map_err(|source| JournalError::Parse { line: idx + 1, source })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_replay_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        let opp = Uuid::new_v4();

        journal.transition(opp, OpportunityState::Detected, OpportunityState::Validated, None);
        journal.append(&JournalEvent::OrderSubmitted {
            opportunity_id: opp,
            leg_index: 0,
            attempt: 0,
            ticker: "A".into(),
            action: Action::Buy,
            side: Side::Yes,
            count: 10,
            limit_price_cents: 50,
            client_order_id: format!("{opp}:0:0"),
            ts: Utc::now(),
        });
        journal.transition(
            opp,
            OpportunityState::Validated,
            OpportunityState::Rejected,
            Some("POLICY_BLOCK".into()),
        );

        let events = Journal::replay(journal.path().unwrap()).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            JournalEvent::OpportunityTransition { to: OpportunityState::Validated, .. }
        ));
        assert!(matches!(&events[1], JournalEvent::OrderSubmitted { count: 10, .. }));
        assert!(matches!(
            &events[2],
            JournalEvent::OpportunityTransition {
                reason: Some(r),
                ..
            } if r == "POLICY_BLOCK"
        ));
    }

    #[test]
    fn disabled_journal_swallows_appends() {
        let journal = Journal::disabled();
        journal.transition(
            Uuid::new_v4(),
            OpportunityState::Detected,
            OpportunityState::Expired,
            None,
        );
        assert!(journal.path().is_none());
    }

    #[test]
    fn replay_reports_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "{\"type\":\"kill_switch\",\"engaged\":true,\"reason\":\"x\",\"ts\":\"2026-03-01T00:00:00Z\"}\nnot json\n").unwrap();
        let err = Journal::replay(&path).unwrap_err();
        assert!(matches!(err, JournalError::Parse { line: 2, .. }));
    }
}

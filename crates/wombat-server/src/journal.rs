use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use wombat_contracts::Phase;
use wombat_kernel::is_legal_advance;

/// Append-only JSONL log of committed transitions, each line hash-chained to
/// the one before it.
pub struct Journal {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub journal_id: String,
    pub ts: String,
    pub problem_id: String,
    pub action: String,
    pub actor: String,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub revision: u64,
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl JournalRecord {
    pub fn new(
        problem_id: &str,
        action: &str,
        actor: &str,
        from_phase: Phase,
        to_phase: Phase,
        revision: u64,
    ) -> Self {
        Self {
            journal_id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now().to_rfc3339(),
            problem_id: problem_id.to_string(),
            action: action.to_string(),
            actor: actor.to_string(),
            from_phase,
            to_phase,
            revision,
            prev_hash: None,
            record_hash: String::new(),
        }
    }
}

impl Journal {
    pub async fn open(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Appends `rec`. Failures are logged; the committed transition stands.
    pub async fn append(&self, mut rec: JournalRecord) {
        // Holding the hash lock across the write keeps the chain in file order.
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash.clear();
        match serde_json::to_string(&rec) {
            Ok(seed) => rec.record_hash = hash_hex(seed.as_bytes()),
            Err(e) => {
                warn!(error = %e, "journal record seed serialize failed");
                return;
            }
        }
        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "journal record serialize failed");
                return;
            }
        };

        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => *last_hash = Some(rec.record_hash),
            Err(e) => warn!(error = %e, problem_id = %rec.problem_id, "journal append failed"),
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Checks the hash chain and that every recorded transition moved its
/// problem forward by at most one phase.
pub fn verify_journal(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut phases: HashMap<String, Vec<(u64, Phase)>> = HashMap::new();
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: JournalRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        if !is_legal_advance(rec.from_phase, rec.to_phase) {
            return Err(format!(
                "line {} illegal transition {} -> {} for {}",
                idx + 1,
                rec.from_phase,
                rec.to_phase,
                rec.problem_id
            ));
        }
        phases
            .entry(rec.problem_id.clone())
            .or_default()
            .push((rec.revision, rec.to_phase));
        prev = Some(rec.record_hash);
        count += 1;
    }

    // Appends of concurrent commits may interleave, so order by revision.
    for (problem_id, mut seen) in phases {
        seen.sort_by_key(|(revision, _)| *revision);
        for pair in seen.windows(2) {
            let ((_, earlier), (revision, later)) = (pair[0], pair[1]);
            if later < earlier {
                return Err(format!(
                    "{problem_id} moves back from {earlier} to {later} at revision {revision}"
                ));
            }
        }
    }

    Ok(format!("journal chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("wombat-journal-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_verifies_and_continues_after_reopen() {
        let path = temp_path();
        {
            let journal = Journal::open(&path).await.unwrap();
            journal
                .append(JournalRecord::new(
                    "p1",
                    "agree_problem",
                    "role_a",
                    Phase::AgreeStatement,
                    Phase::AgreeStatement,
                    1,
                ))
                .await;
            journal
                .append(JournalRecord::new(
                    "p1",
                    "agree_problem",
                    "role_b",
                    Phase::AgreeStatement,
                    Phase::PrivateVersions,
                    2,
                ))
                .await;
        }
        let reopened = Journal::open(&path).await.unwrap();
        reopened
            .append(JournalRecord::new(
                "p1",
                "submit_private_version",
                "role_a",
                Phase::PrivateVersions,
                Phase::PrivateVersions,
                3,
            ))
            .await;

        let summary = verify_journal(&path).unwrap();
        assert!(summary.contains("3 records"), "{summary}");
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let path = temp_path();
        let journal = Journal::open(&path).await.unwrap();
        journal
            .append(JournalRecord::new(
                "p1",
                "advance_to_steelman",
                "role_b",
                Phase::Translation,
                Phase::Steelman,
                7,
            ))
            .await;
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("role_b", "role_a")).unwrap();
        assert!(verify_journal(&path).unwrap_err().contains("record_hash mismatch"));
    }

    #[tokio::test]
    async fn backwards_move_is_reported_by_revision() {
        let path = temp_path();
        let journal = Journal::open(&path).await.unwrap();
        for (revision, from, to) in [
            (4, Phase::Steelman, Phase::SteelmanApproval),
            (3, Phase::Translation, Phase::Steelman),
            (5, Phase::Translation, Phase::Translation),
        ] {
            journal
                .append(JournalRecord::new("p1", "x", "role_a", from, to, revision))
                .await;
        }
        assert!(verify_journal(&path).unwrap_err().contains("moves back"));
    }

    #[tokio::test]
    async fn skipped_phase_is_reported() {
        let path = temp_path();
        let journal = Journal::open(&path).await.unwrap();
        journal
            .append(JournalRecord::new(
                "p1",
                "agree_problem",
                "role_b",
                Phase::AgreeStatement,
                Phase::Translation,
                2,
            ))
            .await;
        assert!(verify_journal(&path).unwrap_err().contains("illegal transition"));
    }
}

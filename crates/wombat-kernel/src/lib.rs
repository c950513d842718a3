mod engine;
mod progress;

pub use engine::{
    is_legal_advance, transition, Action, ActionKind, Actor, FailureKind, PreconditionFailed,
    POST_MORTEM_DELAY_DAYS,
};
pub use progress::{progress_for, redacted_for};

use sha2::{Digest, Sha256};
use wombat_contracts::{Phase, Problem};

/// A phase on entry to which the Wombat contributes generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Verdict,
    Wager,
}

impl Checkpoint {
    pub fn phase(self) -> Phase {
        match self {
            Checkpoint::Verdict => Phase::AiReview,
            Checkpoint::Wager => Phase::Wager,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::Verdict => "verdict",
            Checkpoint::Wager => "wager",
        }
    }

    /// The system action that records `text` for this checkpoint.
    pub fn action(self, text: String) -> Action {
        match self {
            Checkpoint::Verdict => Action::SetAiAnalysis { text },
            Checkpoint::Wager => Action::SetWager { text },
        }
    }
}

pub fn pending_checkpoint(problem: &Problem) -> Option<Checkpoint> {
    match problem.status {
        Phase::AiReview if problem.ai_analysis.is_empty() => Some(Checkpoint::Verdict),
        Phase::Wager if problem.wombats_wager.is_empty() => Some(Checkpoint::Wager),
        _ => None,
    }
}

pub fn checkpoint_key(problem_id: &str, checkpoint: Checkpoint) -> String {
    hash_id("ckpt", &[problem_id, checkpoint.as_str()])
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

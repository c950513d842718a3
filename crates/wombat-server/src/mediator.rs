use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use wombat_contracts::{ActionRequest, NewProblem, Problem, ProblemEnvelope, RolePair, UserId};
use wombat_kernel::{
    progress_for, redacted_for, transition, Action, Actor, Checkpoint, PreconditionFailed,
};

use crate::generation::{GenerationError, Generator};
use crate::journal::{Journal, JournalRecord};
use crate::prompts;
use crate::store::{ProblemStore, StoreError, WriteResult};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Applied(Problem),
    /// The step was already taken; nothing was written.
    AlreadyHandled { problem: Problem, reason: String },
}

impl ActionOutcome {
    pub fn problem(&self) -> &Problem {
        match self {
            ActionOutcome::Applied(problem) => problem,
            ActionOutcome::AlreadyHandled { problem, .. } => problem,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied(_))
    }
}

#[derive(Debug, Error)]
pub enum MediationError {
    #[error("problem {0} not found")]
    NotFound(String),
    #[error("{user} is not a participant of problem {problem_id}")]
    NotParticipant { problem_id: String, user: UserId },
    #[error("action rejected: {0}")]
    Rejected(PreconditionFailed),
    #[error("write still conflicting after {attempts} attempts")]
    WriteConflict { attempts: usize },
    #[error("cannot link partners: {0}")]
    LinkingConflict(String),
    #[error("{0} has no linked partner")]
    NotPaired(UserId),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for MediationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => MediationError::NotFound(id),
            StoreError::AlreadyLinked(user) => MediationError::LinkingConflict(format!(
                "{user} is already linked to another partner"
            )),
            other => MediationError::Store(other),
        }
    }
}

enum Preflight {
    Proceed(Problem),
    Done(ActionOutcome),
}

/// Participant and system actions over the shared store. Every write goes
/// through the transition engine and a revision-checked store write.
pub struct Mediator {
    store: Arc<dyn ProblemStore>,
    generator: Arc<dyn Generator>,
    journal: Option<Arc<Journal>>,
    max_write_attempts: usize,
    clock: Clock,
}

impl Mediator {
    pub fn new(
        store: Arc<dyn ProblemStore>,
        generator: Arc<dyn Generator>,
        max_write_attempts: usize,
    ) -> Self {
        Self {
            store,
            generator,
            journal: None,
            max_write_attempts: max_write_attempts.max(1),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn ProblemStore> {
        &self.store
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub async fn link_partners(&self, invitee: &str, inviter: &str) -> Result<(), MediationError> {
        if invitee == inviter {
            return Err(MediationError::LinkingConflict(
                "cannot partner with yourself".to_string(),
            ));
        }
        self.store.link_partners(inviter, invitee).await?;
        info!(inviter, invitee, "partners linked");
        Ok(())
    }

    /// Opens a problem between `user` (role A) and their linked partner.
    pub async fn create_problem(&self, user: &str) -> Result<Problem, MediationError> {
        let partner = self
            .store
            .partner_of(user)
            .await?
            .ok_or_else(|| MediationError::NotPaired(user.to_string()))?;
        let problem = self
            .store
            .create(NewProblem {
                participants: RolePair::new(user.to_string(), partner),
            })
            .await?;
        info!(problem_id = %problem.id, creator = user, "problem opened");
        Ok(problem)
    }

    pub async fn list_problems(&self, user: &str) -> Result<Vec<Problem>, MediationError> {
        let problems = self.store.list_for(user).await?;
        Ok(problems
            .into_iter()
            .map(|p| redacted_view(p, user))
            .collect())
    }

    pub async fn view(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ProblemEnvelope, MediationError> {
        let problem = self.load(problem_id).await?;
        self.actor_for(&problem, Some(user))?;
        let view = progress_for(Some(&problem), user, (self.clock)());
        Ok(ProblemEnvelope {
            problem: redacted_view(problem, user),
            view,
        })
    }

    pub async fn agree_problem(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::AgreeProblem).await
    }

    /// Records the private version with the Wombat's translation of it. A
    /// failed translation stores a fixed fallback rather than blocking.
    pub async fn submit_private_version(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        let intent = Action::SubmitPrivateVersion {
            text: text.to_string(),
            translation: String::new(),
        };
        if let Preflight::Done(outcome) = self.preflight(problem_id, user, &intent).await? {
            return Ok(outcome);
        }
        let translation = match self.generator.generate(&prompts::translation(text)).await {
            Ok(translation) if !translation.trim().is_empty() => translation,
            Ok(_) => {
                warn!(problem_id, "blank translation; storing fallback");
                prompts::TRANSLATION_FALLBACK.to_string()
            }
            Err(e) => {
                warn!(problem_id, error = %e, "translation failed; storing fallback");
                prompts::TRANSLATION_FALLBACK.to_string()
            }
        };
        self.dispatch(
            problem_id,
            Some(user),
            Action::SubmitPrivateVersion {
                text: text.to_string(),
                translation,
            },
        )
        .await
    }

    pub async fn advance_to_steelman(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::AdvanceToSteelman).await
    }

    pub async fn submit_steelman(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::SubmitSteelman {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn approve_steelman(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::ApproveSteelman).await
    }

    pub async fn set_ai_analysis(
        &self,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.record_checkpoint(problem_id, Checkpoint::Verdict, text.to_string()).await
    }

    pub async fn advance_to_propose_solutions(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::AdvanceToProposeSolutions).await
    }

    pub async fn propose_solution(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::ProposeSolution {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn submit_solution_steelman(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::SubmitSolutionSteelman {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn set_wager(
        &self,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.record_checkpoint(problem_id, Checkpoint::Wager, text.to_string()).await
    }

    pub async fn advance_to_solution(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::AdvanceToSolution).await
    }

    pub async fn agree_solution(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, Some(user), Action::AgreeSolution).await
    }

    pub async fn submit_post_mortem(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::SubmitPostMortem {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn edit_problem_statement(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::EditProblemStatement {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn edit_solution_statement(
        &self,
        user: &str,
        problem_id: &str,
        text: &str,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(
            problem_id,
            Some(user),
            Action::EditSolutionStatement {
                text: text.to_string(),
            },
        )
        .await
    }

    /// Asks for a second opinion on the verdict and records it. Nothing is
    /// written when generation fails.
    pub async fn escalate(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        let intent = Action::RecordEscalation {
            verdict: "pending".to_string(),
        };
        let problem = match self.preflight(problem_id, user, &intent).await? {
            Preflight::Proceed(problem) => problem,
            Preflight::Done(outcome) => return Ok(outcome),
        };
        let verdict = self.generator.generate(&prompts::escalation(&problem)).await?;
        self.dispatch(problem_id, Some(user), Action::RecordEscalation { verdict }).await
    }

    /// Generates solution ideas and records them. Nothing is written when
    /// generation fails.
    pub async fn brainstorm(
        &self,
        user: &str,
        problem_id: &str,
    ) -> Result<ActionOutcome, MediationError> {
        let intent = Action::RecordBrainstorm {
            text: "pending".to_string(),
        };
        let problem = match self.preflight(problem_id, user, &intent).await? {
            Preflight::Proceed(problem) => problem,
            Preflight::Done(outcome) => return Ok(outcome),
        };
        let text = self.generator.generate(&prompts::brainstorm(&problem)).await?;
        self.dispatch(problem_id, Some(user), Action::RecordBrainstorm { text }).await
    }

    pub async fn bs_meter(&self, text: &str) -> String {
        self.remark(&prompts::bs_meter(text), prompts::BS_METER_FALLBACK).await
    }

    pub async fn emergency_wombat(&self) -> String {
        self.remark(&prompts::emergency(), prompts::EMERGENCY_FALLBACK).await
    }

    /// Generated text that is shown and never stored; blank or failed
    /// generation yields `fallback`.
    async fn remark(&self, prompt: &str, fallback: &str) -> String {
        match self.generator.generate(prompt).await {
            Ok(reply) if !reply.trim().is_empty() => reply,
            Ok(_) => {
                debug!("blank remark; using fallback");
                fallback.to_string()
            }
            Err(e) => {
                debug!(error = %e, "remark generation failed; using fallback");
                fallback.to_string()
            }
        }
    }

    /// Writes generated checkpoint text as the system actor.
    pub async fn record_checkpoint(
        &self,
        problem_id: &str,
        checkpoint: Checkpoint,
        text: String,
    ) -> Result<ActionOutcome, MediationError> {
        self.dispatch(problem_id, None, checkpoint.action(text)).await
    }

    pub async fn perform(
        &self,
        user: &str,
        problem_id: &str,
        request: ActionRequest,
    ) -> Result<ActionOutcome, MediationError> {
        match request {
            ActionRequest::AgreeProblem => self.agree_problem(user, problem_id).await,
            ActionRequest::SubmitPrivateVersion { text } => {
                self.submit_private_version(user, problem_id, &text).await
            }
            ActionRequest::AdvanceToSteelman => self.advance_to_steelman(user, problem_id).await,
            ActionRequest::SubmitSteelman { text } => {
                self.submit_steelman(user, problem_id, &text).await
            }
            ActionRequest::ApproveSteelman => self.approve_steelman(user, problem_id).await,
            ActionRequest::AdvanceToProposeSolutions => {
                self.advance_to_propose_solutions(user, problem_id).await
            }
            ActionRequest::ProposeSolution { text } => {
                self.propose_solution(user, problem_id, &text).await
            }
            ActionRequest::SubmitSolutionSteelman { text } => {
                self.submit_solution_steelman(user, problem_id, &text).await
            }
            ActionRequest::AdvanceToSolution => self.advance_to_solution(user, problem_id).await,
            ActionRequest::AgreeSolution => self.agree_solution(user, problem_id).await,
            ActionRequest::SubmitPostMortem { text } => {
                self.submit_post_mortem(user, problem_id, &text).await
            }
            ActionRequest::EditProblemStatement { text } => {
                self.edit_problem_statement(user, problem_id, &text).await
            }
            ActionRequest::EditSolutionStatement { text } => {
                self.edit_solution_statement(user, problem_id, &text).await
            }
            ActionRequest::Escalate => self.escalate(user, problem_id).await,
            ActionRequest::Brainstorm => self.brainstorm(user, problem_id).await,
        }
    }

    async fn load(&self, problem_id: &str) -> Result<Problem, MediationError> {
        self.store
            .read(problem_id)
            .await?
            .ok_or_else(|| MediationError::NotFound(problem_id.to_string()))
    }

    fn actor_for(&self, problem: &Problem, user: Option<&str>) -> Result<Actor, MediationError> {
        match user {
            None => Ok(Actor::System),
            Some(user) => problem
                .role_of(user)
                .map(Actor::Participant)
                .ok_or_else(|| MediationError::NotParticipant {
                    problem_id: problem.id.clone(),
                    user: user.to_string(),
                }),
        }
    }

    /// Checks `action` against the current record before any generation is
    /// spent on it.
    async fn preflight(
        &self,
        problem_id: &str,
        user: &str,
        action: &Action,
    ) -> Result<Preflight, MediationError> {
        let problem = self.load(problem_id).await?;
        let actor = self.actor_for(&problem, Some(user))?;
        match transition(&problem, action, actor, (self.clock)()) {
            Ok(_) => Ok(Preflight::Proceed(problem)),
            Err(failure) if failure.is_stale() => Ok(Preflight::Done(ActionOutcome::AlreadyHandled {
                reason: failure.to_string(),
                problem,
            })),
            Err(failure) => Err(MediationError::Rejected(failure)),
        }
    }

    /// Read, compute, compare-and-swap; on conflict recompute against the
    /// record that won.
    async fn dispatch(
        &self,
        problem_id: &str,
        user: Option<&str>,
        action: Action,
    ) -> Result<ActionOutcome, MediationError> {
        let kind = action.kind();
        let mut latest: Option<Problem> = None;
        for attempt in 1..=self.max_write_attempts {
            let problem = match latest.take() {
                Some(problem) => problem,
                None => self.load(problem_id).await?,
            };
            let actor = self.actor_for(&problem, user)?;
            let patch = match transition(&problem, &action, actor, (self.clock)()) {
                Ok(patch) => patch,
                Err(failure) if failure.is_stale() => {
                    debug!(
                        problem_id,
                        action = %kind,
                        reason = %failure.message,
                        "already handled"
                    );
                    return Ok(ActionOutcome::AlreadyHandled {
                        reason: failure.to_string(),
                        problem,
                    });
                }
                Err(failure) => {
                    info!(
                        problem_id,
                        action = %kind,
                        failure = failure.kind.as_str(),
                        reason = %failure.message,
                        "action rejected"
                    );
                    return Err(MediationError::Rejected(failure));
                }
            };

            match self.store.write(problem_id, problem.revision, &patch).await? {
                WriteResult::Committed(updated) => {
                    info!(
                        problem_id,
                        action = %kind,
                        actor = actor_label(actor),
                        from = %problem.status,
                        to = %updated.status,
                        revision = updated.revision,
                        "transition committed"
                    );
                    if let Some(journal) = &self.journal {
                        journal
                            .append(JournalRecord::new(
                                problem_id,
                                kind.as_str(),
                                actor_label(actor),
                                problem.status,
                                updated.status,
                                updated.revision,
                            ))
                            .await;
                    }
                    return Ok(ActionOutcome::Applied(updated));
                }
                WriteResult::Conflict(current) => {
                    debug!(
                        problem_id,
                        action = %kind,
                        attempt,
                        revision = current.revision,
                        "write conflict; recomputing"
                    );
                    latest = Some(current);
                }
            }
        }
        warn!(
            problem_id,
            action = %kind,
            attempts = self.max_write_attempts,
            "giving up after write conflicts"
        );
        Err(MediationError::WriteConflict {
            attempts: self.max_write_attempts,
        })
    }
}

/// `problem` as `user` may see it; non-participants get it unchanged.
pub fn redacted_view(problem: Problem, user: &str) -> Problem {
    match problem.role_of(user) {
        Some(role) => redacted_for(&problem, role),
        None => problem,
    }
}

fn actor_label(actor: Actor) -> &'static str {
    match actor {
        Actor::Participant(role) => role.as_str(),
        Actor::System => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::DisabledGenerator;
    use crate::store::BackendStore;
    use wombat_contracts::{Phase, ProblemView};

    fn mediator() -> Mediator {
        Mediator::new(
            Arc::new(BackendStore::memory()),
            Arc::new(DisabledGenerator),
            3,
        )
    }

    async fn paired(m: &Mediator) -> Problem {
        m.link_partners("user2", "user1").await.unwrap();
        m.create_problem("user1").await.unwrap()
    }

    #[tokio::test]
    async fn creator_takes_role_a() {
        let m = mediator();
        let p = paired(&m).await;
        assert_eq!(p.participants.role_a, "user1");
        assert_eq!(p.participants.role_b, "user2");
        assert_eq!(p.status, Phase::AgreeStatement);
    }

    #[tokio::test]
    async fn unpaired_user_cannot_open_a_problem() {
        let m = mediator();
        assert!(matches!(
            m.create_problem("loner").await,
            Err(MediationError::NotPaired(_))
        ));
    }

    #[tokio::test]
    async fn linking_to_someone_already_partnered_is_a_conflict() {
        let m = mediator();
        m.link_partners("user2", "user1").await.unwrap();
        assert!(matches!(
            m.link_partners("user3", "user1").await,
            Err(MediationError::LinkingConflict(_))
        ));
        assert!(matches!(
            m.link_partners("user3", "user3").await,
            Err(MediationError::LinkingConflict(_))
        ));
        assert_eq!(m.store().partner_of("user3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn repeated_agreement_is_already_handled() {
        let m = mediator();
        let p = paired(&m).await;
        assert!(m.agree_problem("user1", &p.id).await.unwrap().is_applied());
        let again = m.agree_problem("user1", &p.id).await.unwrap();
        assert!(matches!(again, ActionOutcome::AlreadyHandled { .. }));
        assert_eq!(again.problem().revision, 1);
    }

    #[tokio::test]
    async fn outsiders_and_missing_records_are_errors() {
        let m = mediator();
        let p = paired(&m).await;
        assert!(matches!(
            m.agree_problem("stranger", &p.id).await,
            Err(MediationError::NotParticipant { .. })
        ));
        assert!(matches!(
            m.agree_problem("user1", "nope").await,
            Err(MediationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn translation_failure_stores_fallback() {
        let m = mediator();
        let p = paired(&m).await;
        m.agree_problem("user1", &p.id).await.unwrap();
        m.agree_problem("user2", &p.id).await.unwrap();
        let out = m
            .submit_private_version("user2", &p.id, "I do everything")
            .await
            .unwrap();
        let side = &out.problem().sides.role_b;
        assert_eq!(side.translation, prompts::TRANSLATION_FALLBACK);
        assert!(side.submitted_private);
    }

    #[tokio::test]
    async fn view_hides_partner_private_text_before_translation() {
        let m = mediator();
        let p = paired(&m).await;
        m.agree_problem("user1", &p.id).await.unwrap();
        m.agree_problem("user2", &p.id).await.unwrap();
        m.submit_private_version("user2", &p.id, "secret").await.unwrap();

        let seen = m.view("user1", &p.id).await.unwrap();
        assert!(seen.problem.sides.role_b.private_version.is_empty());
        match seen.view {
            ProblemView::Loaded(v) => assert!(v.submitted_private.partner),
            other => panic!("unexpected view {other:?}"),
        }
        let own = m.view("user2", &p.id).await.unwrap();
        assert_eq!(own.problem.sides.role_b.private_version, "secret");
    }

    #[tokio::test]
    async fn fallback_texts_when_generation_is_down() {
        let m = mediator();
        assert_eq!(m.bs_meter("I hear you").await, prompts::BS_METER_FALLBACK);
        assert_eq!(m.emergency_wombat().await, prompts::EMERGENCY_FALLBACK);
    }

    struct Blank;

    #[async_trait::async_trait]
    impl Generator for Blank {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Ok("  \n".to_string())
        }
    }

    #[tokio::test]
    async fn blank_remarks_fall_back() {
        let m = Mediator::new(Arc::new(BackendStore::memory()), Arc::new(Blank), 3);
        assert_eq!(m.bs_meter("I hear you").await, prompts::BS_METER_FALLBACK);
        assert_eq!(m.emergency_wombat().await, prompts::EMERGENCY_FALLBACK);
    }
}

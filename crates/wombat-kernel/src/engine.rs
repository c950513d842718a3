use chrono::{DateTime, Duration, Utc};
use std::fmt;
use wombat_contracts::{Phase, Problem, ProblemPatch, Role, SidePatch};

/// Days between both parties agreeing on a solution and the post-mortem opening.
pub const POST_MORTEM_DELAY_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AgreeProblem,
    SubmitPrivateVersion { text: String, translation: String },
    AdvanceToSteelman,
    SubmitSteelman { text: String },
    ApproveSteelman,
    SetAiAnalysis { text: String },
    AdvanceToProposeSolutions,
    ProposeSolution { text: String },
    SubmitSolutionSteelman { text: String },
    SetWager { text: String },
    AdvanceToSolution,
    AgreeSolution,
    SubmitPostMortem { text: String },
    EditProblemStatement { text: String },
    EditSolutionStatement { text: String },
    RecordBrainstorm { text: String },
    RecordEscalation { verdict: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    AgreeProblem,
    SubmitPrivateVersion,
    AdvanceToSteelman,
    SubmitSteelman,
    ApproveSteelman,
    SetAiAnalysis,
    AdvanceToProposeSolutions,
    ProposeSolution,
    SubmitSolutionSteelman,
    SetWager,
    AdvanceToSolution,
    AgreeSolution,
    SubmitPostMortem,
    EditProblemStatement,
    EditSolutionStatement,
    RecordBrainstorm,
    RecordEscalation,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::AgreeProblem => "agree_problem",
            ActionKind::SubmitPrivateVersion => "submit_private_version",
            ActionKind::AdvanceToSteelman => "advance_to_steelman",
            ActionKind::SubmitSteelman => "submit_steelman",
            ActionKind::ApproveSteelman => "approve_steelman",
            ActionKind::SetAiAnalysis => "set_ai_analysis",
            ActionKind::AdvanceToProposeSolutions => "advance_to_propose_solutions",
            ActionKind::ProposeSolution => "propose_solution",
            ActionKind::SubmitSolutionSteelman => "submit_solution_steelman",
            ActionKind::SetWager => "set_wager",
            ActionKind::AdvanceToSolution => "advance_to_solution",
            ActionKind::AgreeSolution => "agree_solution",
            ActionKind::SubmitPostMortem => "submit_post_mortem",
            ActionKind::EditProblemStatement => "edit_problem_statement",
            ActionKind::EditSolutionStatement => "edit_solution_statement",
            ActionKind::RecordBrainstorm => "record_brainstorm",
            ActionKind::RecordEscalation => "record_escalation",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::AgreeProblem => ActionKind::AgreeProblem,
            Action::SubmitPrivateVersion { .. } => ActionKind::SubmitPrivateVersion,
            Action::AdvanceToSteelman => ActionKind::AdvanceToSteelman,
            Action::SubmitSteelman { .. } => ActionKind::SubmitSteelman,
            Action::ApproveSteelman => ActionKind::ApproveSteelman,
            Action::SetAiAnalysis { .. } => ActionKind::SetAiAnalysis,
            Action::AdvanceToProposeSolutions => ActionKind::AdvanceToProposeSolutions,
            Action::ProposeSolution { .. } => ActionKind::ProposeSolution,
            Action::SubmitSolutionSteelman { .. } => ActionKind::SubmitSolutionSteelman,
            Action::SetWager { .. } => ActionKind::SetWager,
            Action::AdvanceToSolution => ActionKind::AdvanceToSolution,
            Action::AgreeSolution => ActionKind::AgreeSolution,
            Action::SubmitPostMortem { .. } => ActionKind::SubmitPostMortem,
            Action::EditProblemStatement { .. } => ActionKind::EditProblemStatement,
            Action::EditSolutionStatement { .. } => ActionKind::EditSolutionStatement,
            Action::RecordBrainstorm { .. } => ActionKind::RecordBrainstorm,
            Action::RecordEscalation { .. } => ActionKind::RecordEscalation,
        }
    }

    /// System actions carry generated text and are never role-scoped.
    pub fn is_system(&self) -> bool {
        matches!(self, Action::SetAiAnalysis { .. } | Action::SetWager { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Participant(Role),
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The step was already taken, by this role or by a racing write.
    Stale,
    /// The record has not reached the state this action needs.
    OutOfSequence,
    NotPermitted,
    InvalidPayload,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Stale => "stale",
            FailureKind::OutOfSequence => "out_of_sequence",
            FailureKind::NotPermitted => "not_permitted",
            FailureKind::InvalidPayload => "invalid_payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFailed {
    pub action: ActionKind,
    pub kind: FailureKind,
    pub message: String,
}

impl PreconditionFailed {
    pub fn is_stale(&self) -> bool {
        self.kind == FailureKind::Stale
    }
}

impl fmt::Display for PreconditionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.kind.as_str(), self.message)
    }
}

impl std::error::Error for PreconditionFailed {}

/// Computes the partial update `action` makes to `problem`.
///
/// A phase advance is only ever emitted by the write that completes the
/// second party's half of a paired step. The returned patch is never empty.
pub fn transition(
    problem: &Problem,
    action: &Action,
    actor: Actor,
    now: DateTime<Utc>,
) -> Result<ProblemPatch, PreconditionFailed> {
    let kind = action.kind();
    match (actor, action.is_system()) {
        (Actor::System, true) => system_transition(problem, action),
        (Actor::Participant(role), false) => participant_transition(problem, action, role, now),
        (Actor::System, false) => Err(fail(
            kind,
            FailureKind::NotPermitted,
            "participant action issued without a participant",
        )),
        (Actor::Participant(_), true) => Err(fail(
            kind,
            FailureKind::NotPermitted,
            "system action issued by a participant",
        )),
    }
}

fn system_transition(
    problem: &Problem,
    action: &Action,
) -> Result<ProblemPatch, PreconditionFailed> {
    let kind = action.kind();
    match action {
        Action::SetAiAnalysis { text } => {
            require_phase(problem, Phase::AiReview, kind)?;
            if !problem.ai_analysis.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "analysis already written"));
            }
            require_text(text, kind)?;
            Ok(ProblemPatch {
                ai_analysis: Some(text.clone()),
                ..ProblemPatch::default()
            })
        }
        Action::SetWager { text } => {
            require_phase(problem, Phase::Wager, kind)?;
            if !problem.wombats_wager.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "wager already written"));
            }
            require_text(text, kind)?;
            Ok(ProblemPatch {
                wombats_wager: Some(text.clone()),
                ..ProblemPatch::default()
            })
        }
        _ => Err(fail(kind, FailureKind::NotPermitted, "not a system action")),
    }
}

fn participant_transition(
    problem: &Problem,
    action: &Action,
    role: Role,
    now: DateTime<Utc>,
) -> Result<ProblemPatch, PreconditionFailed> {
    let kind = action.kind();
    let mine = problem.side(role);
    let partner = problem.side(role.partner());

    match action {
        Action::AgreeProblem => {
            require_phase(problem, Phase::AgreeStatement, kind)?;
            if mine.agreed_problem {
                return Err(fail(kind, FailureKind::Stale, "already agreed"));
            }
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    agreed_problem: Some(true),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(patch, partner.agreed_problem, Phase::PrivateVersions))
        }
        Action::SubmitPrivateVersion { text, translation } => {
            require_phase(problem, Phase::PrivateVersions, kind)?;
            if mine.submitted_private {
                return Err(fail(kind, FailureKind::Stale, "private version already submitted"));
            }
            require_text(text, kind)?;
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    private_version: Some(text.clone()),
                    submitted_private: Some(true),
                    translation: Some(translation.clone()),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(patch, partner.submitted_private, Phase::Translation))
        }
        Action::AdvanceToSteelman => {
            require_phase(problem, Phase::Translation, kind)?;
            Ok(ProblemPatch::default().with_status(Phase::Steelman))
        }
        Action::SubmitSteelman { text } => {
            require_phase(problem, Phase::Steelman, kind)?;
            if mine.submitted_steelman {
                return Err(fail(kind, FailureKind::Stale, "steelman already submitted"));
            }
            require_text(text, kind)?;
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    steelman: Some(text.clone()),
                    submitted_steelman: Some(true),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(patch, partner.submitted_steelman, Phase::SteelmanApproval))
        }
        Action::ApproveSteelman => {
            require_phase(problem, Phase::SteelmanApproval, kind)?;
            if mine.approved_steelman {
                return Err(fail(kind, FailureKind::Stale, "steelman already approved"));
            }
            if partner.steelman.trim().is_empty() {
                return Err(fail(
                    kind,
                    FailureKind::OutOfSequence,
                    "partner has no steelman to approve",
                ));
            }
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    approved_steelman: Some(true),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(patch, partner.approved_steelman, Phase::AiReview))
        }
        Action::AdvanceToProposeSolutions => {
            require_phase(problem, Phase::AiReview, kind)?;
            if problem.ai_analysis.is_empty() {
                return Err(fail(kind, FailureKind::OutOfSequence, "verdict not delivered yet"));
            }
            Ok(ProblemPatch::default().with_status(Phase::ProposeSolutions))
        }
        Action::ProposeSolution { text } => {
            require_phase(problem, Phase::ProposeSolutions, kind)?;
            if !mine.proposed_solution.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "solution already proposed"));
            }
            require_text(text, kind)?;
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    proposed_solution: Some(text.clone()),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(
                patch,
                !partner.proposed_solution.is_empty(),
                Phase::SolutionSteelman,
            ))
        }
        Action::SubmitSolutionSteelman { text } => {
            require_phase(problem, Phase::SolutionSteelman, kind)?;
            if !mine.solution_steelman.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "solution steelman already submitted"));
            }
            if partner.proposed_solution.is_empty() {
                return Err(fail(
                    kind,
                    FailureKind::OutOfSequence,
                    "partner has not proposed a solution",
                ));
            }
            require_text(text, kind)?;
            let patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    solution_steelman: Some(text.clone()),
                    ..SidePatch::default()
                },
            );
            Ok(advance_if(patch, !partner.solution_steelman.is_empty(), Phase::Wager))
        }
        Action::AdvanceToSolution => {
            require_phase(problem, Phase::Wager, kind)?;
            if problem.wombats_wager.is_empty() {
                return Err(fail(kind, FailureKind::OutOfSequence, "wager not delivered yet"));
            }
            Ok(ProblemPatch::default().with_status(Phase::Solution))
        }
        Action::AgreeSolution => {
            require_phase(problem, Phase::Solution, kind)?;
            if mine.agreed_solution {
                return Err(fail(kind, FailureKind::Stale, "solution already agreed"));
            }
            let mut patch = ProblemPatch::for_role(
                role,
                SidePatch {
                    agreed_solution: Some(true),
                    ..SidePatch::default()
                },
            );
            if partner.agreed_solution {
                patch.status = Some(Phase::Resolved);
                patch.solution_check_date = Some(now + Duration::days(POST_MORTEM_DELAY_DAYS));
            }
            Ok(patch)
        }
        Action::SubmitPostMortem { text } => {
            require_phase(problem, Phase::Resolved, kind)?;
            if !mine.post_mortem.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "post-mortem already written"));
            }
            match problem.solution_check_date {
                Some(opens_at) if now >= opens_at => {}
                Some(opens_at) => {
                    return Err(fail(
                        kind,
                        FailureKind::OutOfSequence,
                        &format!("post-mortem opens at {}", opens_at.to_rfc3339()),
                    ))
                }
                None => {
                    return Err(fail(
                        kind,
                        FailureKind::OutOfSequence,
                        "no solution check date recorded",
                    ))
                }
            }
            require_text(text, kind)?;
            Ok(ProblemPatch::for_role(
                role,
                SidePatch {
                    post_mortem: Some(text.clone()),
                    ..SidePatch::default()
                },
            ))
        }
        Action::EditProblemStatement { text } => {
            require_phase(problem, Phase::AgreeStatement, kind)?;
            if mine.agreed_problem {
                return Err(fail(kind, FailureKind::Stale, "statement locked after agreeing"));
            }
            require_text(text, kind)?;
            Ok(ProblemPatch {
                problem_statement: Some(text.clone()),
                ..ProblemPatch::default()
            })
        }
        Action::EditSolutionStatement { text } => {
            require_phase(problem, Phase::Solution, kind)?;
            if mine.agreed_solution {
                return Err(fail(kind, FailureKind::Stale, "solution locked after agreeing"));
            }
            require_text(text, kind)?;
            Ok(ProblemPatch {
                solution_statement: Some(text.clone()),
                ..ProblemPatch::default()
            })
        }
        Action::RecordBrainstorm { text } => {
            require_phase(problem, Phase::Solution, kind)?;
            if !problem.brainstormed_solutions.is_empty() {
                return Err(fail(kind, FailureKind::Stale, "brainstorm already recorded"));
            }
            require_text(text, kind)?;
            Ok(ProblemPatch {
                brainstormed_solutions: Some(text.clone()),
                ..ProblemPatch::default()
            })
        }
        Action::RecordEscalation { verdict } => {
            if problem.status < Phase::AiReview {
                return Err(fail(
                    kind,
                    FailureKind::OutOfSequence,
                    "escalation opens with the verdict",
                ));
            }
            if problem.escalated_for_human_review {
                return Err(fail(kind, FailureKind::Stale, "already escalated"));
            }
            require_text(verdict, kind)?;
            Ok(ProblemPatch {
                human_verdict: Some(verdict.clone()),
                escalated_for_human_review: Some(true),
                ..ProblemPatch::default()
            })
        }
        Action::SetAiAnalysis { .. } | Action::SetWager { .. } => {
            Err(fail(kind, FailureKind::NotPermitted, "system action issued by a participant"))
        }
    }
}

/// True when `to` is `from` itself or the phase directly after it.
pub fn is_legal_advance(from: Phase, to: Phase) -> bool {
    to == from || from.next() == Some(to)
}

fn advance_if(patch: ProblemPatch, partner_done: bool, next: Phase) -> ProblemPatch {
    if partner_done {
        patch.with_status(next)
    } else {
        patch
    }
}

fn require_phase(
    problem: &Problem,
    expected: Phase,
    action: ActionKind,
) -> Result<(), PreconditionFailed> {
    if problem.status == expected {
        return Ok(());
    }
    let kind = if problem.status > expected {
        FailureKind::Stale
    } else {
        FailureKind::OutOfSequence
    };
    Err(fail(
        action,
        kind,
        &format!("requires phase {expected}, record is in {}", problem.status),
    ))
}

fn require_text(text: &str, action: ActionKind) -> Result<(), PreconditionFailed> {
    if text.trim().is_empty() {
        return Err(fail(action, FailureKind::InvalidPayload, "text must not be blank"));
    }
    Ok(())
}

fn fail(action: ActionKind, kind: FailureKind, message: &str) -> PreconditionFailed {
    PreconditionFailed {
        action,
        kind,
        message: message.to_string(),
    }
}

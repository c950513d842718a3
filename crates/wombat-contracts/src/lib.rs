use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    RoleA,
    RoleB,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::RoleA, Role::RoleB];

    pub fn partner(self) -> Role {
        match self {
            Role::RoleA => Role::RoleB,
            Role::RoleB => Role::RoleA,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::RoleA => "role_a",
            Role::RoleB => "role_b",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per role. Every role-owned piece of a problem lives in one of
/// these, so role-scoped access is an index by [`Role`], never a field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePair<T> {
    pub role_a: T,
    pub role_b: T,
}

impl<T> RolePair<T> {
    pub fn new(role_a: T, role_b: T) -> Self {
        Self { role_a, role_b }
    }

    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::RoleA => &self.role_a,
            Role::RoleB => &self.role_b,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut T {
        match role {
            Role::RoleA => &mut self.role_a,
            Role::RoleB => &mut self.role_b,
        }
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> RolePair<U> {
        RolePair {
            role_a: f(&self.role_a),
            role_b: f(&self.role_b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AgreeStatement,
    PrivateVersions,
    Translation,
    Steelman,
    SteelmanApproval,
    AiReview,
    ProposeSolutions,
    SolutionSteelman,
    Wager,
    Solution,
    Resolved,
}

impl Phase {
    pub const SEQUENCE: [Phase; 11] = [
        Phase::AgreeStatement,
        Phase::PrivateVersions,
        Phase::Translation,
        Phase::Steelman,
        Phase::SteelmanApproval,
        Phase::AiReview,
        Phase::ProposeSolutions,
        Phase::SolutionSteelman,
        Phase::Wager,
        Phase::Solution,
        Phase::Resolved,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// The phase directly after this one; `None` for `Resolved`.
    pub fn next(self) -> Option<Phase> {
        Self::SEQUENCE.get(self.ordinal() + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Resolved
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AgreeStatement => "agree_statement",
            Phase::PrivateVersions => "private_versions",
            Phase::Translation => "translation",
            Phase::Steelman => "steelman",
            Phase::SteelmanApproval => "steelman_approval",
            Phase::AiReview => "ai_review",
            Phase::ProposeSolutions => "propose_solutions",
            Phase::SolutionSteelman => "solution_steelman",
            Phase::Wager => "wager",
            Phase::Solution => "solution",
            Phase::Resolved => "resolved",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleState {
    #[serde(default)]
    pub agreed_problem: bool,
    #[serde(default)]
    pub private_version: String,
    #[serde(default)]
    pub submitted_private: bool,
    #[serde(default)]
    pub translation: String,
    #[serde(default)]
    pub steelman: String,
    #[serde(default)]
    pub submitted_steelman: bool,
    #[serde(default)]
    pub approved_steelman: bool,
    #[serde(default)]
    pub proposed_solution: String,
    #[serde(default)]
    pub solution_steelman: String,
    #[serde(default)]
    pub agreed_solution: bool,
    #[serde(default)]
    pub post_mortem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    pub participants: RolePair<UserId>,
    pub status: Phase,
    pub sides: RolePair<RoleState>,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub ai_analysis: String,
    #[serde(default)]
    pub wombats_wager: String,
    #[serde(default)]
    pub solution_statement: String,
    #[serde(default)]
    pub brainstormed_solutions: String,
    #[serde(default)]
    pub human_verdict: String,
    #[serde(default)]
    pub escalated_for_human_review: bool,
    #[serde(default)]
    pub solution_check_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl Problem {
    pub fn new(id: String, participants: RolePair<UserId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            participants,
            status: Phase::AgreeStatement,
            sides: RolePair::default(),
            problem_statement: String::new(),
            ai_analysis: String::new(),
            wombats_wager: String::new(),
            solution_statement: String::new(),
            brainstormed_solutions: String::new(),
            human_verdict: String::new(),
            escalated_for_human_review: false,
            solution_check_date: None,
            created_at,
            revision: 0,
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|role| self.participants.get(*role) == user_id)
    }

    pub fn side(&self, role: Role) -> &RoleState {
        self.sides.get(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProblem {
    pub participants: RolePair<UserId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreed_problem: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steelman: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_steelman: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_steelman: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_steelman: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreed_solution: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_mortem: Option<String>,
}

impl SidePatch {
    pub fn is_empty(&self) -> bool {
        *self == SidePatch::default()
    }

    pub fn apply(&self, state: &mut RoleState) {
        set_if(&mut state.agreed_problem, &self.agreed_problem);
        set_if(&mut state.private_version, &self.private_version);
        set_if(&mut state.submitted_private, &self.submitted_private);
        set_if(&mut state.translation, &self.translation);
        set_if(&mut state.steelman, &self.steelman);
        set_if(&mut state.submitted_steelman, &self.submitted_steelman);
        set_if(&mut state.approved_steelman, &self.approved_steelman);
        set_if(&mut state.proposed_solution, &self.proposed_solution);
        set_if(&mut state.solution_steelman, &self.solution_steelman);
        set_if(&mut state.agreed_solution, &self.agreed_solution);
        set_if(&mut state.post_mortem, &self.post_mortem);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideUpdate {
    pub role: Role,
    pub fields: SidePatch,
}

/// A partial update to one problem. At most one role's half can be carried,
/// so a role-scoped write cannot reach the partner's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<SideUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wombats_wager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brainstormed_solutions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_verdict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_for_human_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_check_date: Option<DateTime<Utc>>,
}

impl ProblemPatch {
    pub fn for_role(role: Role, fields: SidePatch) -> Self {
        Self {
            side: Some(SideUpdate { role, fields }),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: Phase) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        let side_empty = self
            .side
            .as_ref()
            .map(|s| s.fields.is_empty())
            .unwrap_or(true);
        side_empty
            && ProblemPatch {
                side: None,
                ..self.clone()
            } == ProblemPatch::default()
    }

    pub fn touched_role(&self) -> Option<Role> {
        self.side.as_ref().map(|s| s.role)
    }

    /// Merges the patch into `problem`. Identity, participants, creation time
    /// and revision are never touched here; the store owns the revision.
    pub fn apply(&self, problem: &mut Problem) {
        set_if(&mut problem.status, &self.status);
        if let Some(side) = &self.side {
            side.fields.apply(problem.sides.get_mut(side.role));
        }
        set_if(&mut problem.problem_statement, &self.problem_statement);
        set_if(&mut problem.ai_analysis, &self.ai_analysis);
        set_if(&mut problem.wombats_wager, &self.wombats_wager);
        set_if(&mut problem.solution_statement, &self.solution_statement);
        set_if(&mut problem.brainstormed_solutions, &self.brainstormed_solutions);
        set_if(&mut problem.human_verdict, &self.human_verdict);
        set_if(
            &mut problem.escalated_for_human_review,
            &self.escalated_for_human_review,
        );
        if let Some(date) = self.solution_check_date {
            problem.solution_check_date = Some(date);
        }
    }
}

fn set_if<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AgreedProblem,
    SubmittedPrivate,
    SubmittedSteelman,
    ApprovedSteelman,
    ProposedSolution,
    SubmittedSolutionSteelman,
    AgreedSolution,
    PostMortem,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub mine: bool,
    pub partner: bool,
}

impl StepProgress {
    pub fn both(self) -> bool {
        self.mine && self.partner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    pub my_role: Role,
    pub partner_role: Role,
    pub partner_id: UserId,
    pub phase: Phase,
    pub agreed_problem: StepProgress,
    pub submitted_private: StepProgress,
    pub submitted_steelman: StepProgress,
    pub approved_steelman: StepProgress,
    pub proposed_solution: StepProgress,
    pub submitted_solution_steelman: StepProgress,
    pub agreed_solution: StepProgress,
    pub post_mortem: StepProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Step>,
    pub awaiting_checkpoint: bool,
    pub post_mortem_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProblemView {
    NoProblem,
    NotParticipant,
    Loaded(ProgressView),
}

/// Participant-facing actions. System actions and the translation payload
/// are never accepted from a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    AgreeProblem,
    SubmitPrivateVersion { text: String },
    AdvanceToSteelman,
    SubmitSteelman { text: String },
    ApproveSteelman,
    AdvanceToProposeSolutions,
    ProposeSolution { text: String },
    SubmitSolutionSteelman { text: String },
    AdvanceToSolution,
    AgreeSolution,
    SubmitPostMortem { text: String },
    EditProblemStatement { text: String },
    EditSolutionStatement { text: String },
    Escalate,
    Brainstorm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Applied,
    AlreadyHandled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionResponse {
    pub outcome: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub problem: Problem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemEnvelope {
    pub problem: Problem,
    pub view: ProblemView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkPartnersRequest {
    pub inviter_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WombatReply {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Problem {
        Problem::new(
            "p1".to_string(),
            RolePair::new("user1".to_string(), "user2".to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn phase_sequence_matches_declaration_order() {
        for (idx, phase) in Phase::SEQUENCE.iter().enumerate() {
            assert_eq!(phase.ordinal(), idx);
        }
        assert_eq!(Phase::AgreeStatement.next(), Some(Phase::PrivateVersions));
        assert_eq!(Phase::Solution.next(), Some(Phase::Resolved));
        assert_eq!(Phase::Resolved.next(), None);
        assert!(Phase::Wager < Phase::Solution);
    }

    #[test]
    fn phase_serializes_as_snake_case_name() {
        for phase in Phase::SEQUENCE {
            assert_eq!(serde_json::to_value(phase).unwrap(), json!(phase.as_str()));
        }
    }

    #[test]
    fn role_lookup_is_bijective() {
        let p = sample();
        assert_eq!(p.role_of("user1"), Some(Role::RoleA));
        assert_eq!(p.role_of("user2"), Some(Role::RoleB));
        assert_eq!(p.role_of("stranger"), None);
        assert_eq!(Role::RoleA.partner(), Role::RoleB);
        assert_eq!(Role::RoleB.partner(), Role::RoleA);
    }

    #[test]
    fn role_patch_only_touches_its_own_side() {
        let mut p = sample();
        let before_b = p.sides.role_b.clone();
        ProblemPatch::for_role(
            Role::RoleA,
            SidePatch {
                agreed_problem: Some(true),
                steelman: Some("fair point".to_string()),
                ..SidePatch::default()
            },
        )
        .with_status(Phase::PrivateVersions)
        .apply(&mut p);

        assert!(p.sides.role_a.agreed_problem);
        assert_eq!(p.sides.role_a.steelman, "fair point");
        assert_eq!(p.sides.role_b, before_b);
        assert_eq!(p.status, Phase::PrivateVersions);
        assert_eq!(p.revision, 0);
    }

    #[test]
    fn empty_patch_detection_ignores_empty_side() {
        assert!(ProblemPatch::default().is_empty());
        assert!(ProblemPatch::for_role(Role::RoleB, SidePatch::default()).is_empty());
        assert!(!ProblemPatch::default().with_status(Phase::Steelman).is_empty());
        let shared = ProblemPatch {
            ai_analysis: Some("verdict".to_string()),
            ..ProblemPatch::default()
        };
        assert!(!shared.is_empty());
        assert_eq!(shared.touched_role(), None);
    }

    #[test]
    fn action_request_uses_action_tag() {
        let req: ActionRequest =
            serde_json::from_value(json!({"action": "propose_solution", "text": "split it"}))
                .unwrap();
        assert_eq!(
            req,
            ActionRequest::ProposeSolution {
                text: "split it".to_string()
            }
        );
        let agree: ActionRequest =
            serde_json::from_value(json!({"action": "agree_problem"})).unwrap();
        assert_eq!(agree, ActionRequest::AgreeProblem);
        assert!(serde_json::from_value::<ActionRequest>(
            json!({"action": "set_ai_analysis", "text": "x"})
        )
        .is_err());
    }
}

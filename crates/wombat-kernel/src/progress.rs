use chrono::{DateTime, Utc};
use wombat_contracts::{
    Phase, Problem, ProblemView, ProgressView, Role, RoleState, Step, StepProgress,
};

use crate::pending_checkpoint;

/// Projects `problem` onto what `viewer` has done and what their partner has
/// done, for every paired step.
pub fn progress_for(problem: Option<&Problem>, viewer: &str, now: DateTime<Utc>) -> ProblemView {
    let Some(problem) = problem else {
        return ProblemView::NoProblem;
    };
    let Some(my_role) = problem.role_of(viewer) else {
        return ProblemView::NotParticipant;
    };
    let partner_role = my_role.partner();
    let mine = problem.side(my_role);
    let partner = problem.side(partner_role);
    let step = |done: fn(&RoleState) -> bool| StepProgress {
        mine: done(mine),
        partner: done(partner),
    };

    ProblemView::Loaded(ProgressView {
        my_role,
        partner_role,
        partner_id: problem.participants.get(partner_role).clone(),
        phase: problem.status,
        agreed_problem: step(|s| s.agreed_problem),
        submitted_private: step(|s| s.submitted_private),
        submitted_steelman: step(|s| s.submitted_steelman),
        approved_steelman: step(|s| s.approved_steelman),
        proposed_solution: step(|s| !s.proposed_solution.is_empty()),
        submitted_solution_steelman: step(|s| !s.solution_steelman.is_empty()),
        agreed_solution: step(|s| s.agreed_solution),
        post_mortem: step(|s| !s.post_mortem.is_empty()),
        current_step: current_step(problem.status),
        awaiting_checkpoint: pending_checkpoint(problem).is_some(),
        post_mortem_open: problem.status == Phase::Resolved
            && problem
                .solution_check_date
                .map(|opens_at| now >= opens_at)
                .unwrap_or(false),
    })
}

fn current_step(phase: Phase) -> Option<Step> {
    match phase {
        Phase::AgreeStatement => Some(Step::AgreedProblem),
        Phase::PrivateVersions => Some(Step::SubmittedPrivate),
        Phase::Steelman => Some(Step::SubmittedSteelman),
        Phase::SteelmanApproval => Some(Step::ApprovedSteelman),
        Phase::ProposeSolutions => Some(Step::ProposedSolution),
        Phase::SolutionSteelman => Some(Step::SubmittedSolutionSteelman),
        Phase::Solution => Some(Step::AgreedSolution),
        Phase::Resolved => Some(Step::PostMortem),
        Phase::Translation | Phase::AiReview | Phase::Wager => None,
    }
}

/// Copy of `problem` as `viewer` may read it: the partner's private version
/// and its translation stay hidden until both are revealed in `translation`.
pub fn redacted_for(problem: &Problem, viewer: Role) -> Problem {
    let mut copy = problem.clone();
    if problem.status < Phase::Translation {
        let partner = copy.sides.get_mut(viewer.partner());
        partner.private_version.clear();
        partner.translation.clear();
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wombat_contracts::RolePair;

    fn problem() -> Problem {
        Problem::new(
            "p".to_string(),
            RolePair::new("user1".to_string(), "user2".to_string()),
            Utc::now(),
        )
    }

    fn loaded(view: ProblemView) -> ProgressView {
        match view {
            ProblemView::Loaded(v) => v,
            other => panic!("expected loaded view, got {other:?}"),
        }
    }

    #[test]
    fn absent_problem_has_explicit_shape() {
        assert_eq!(progress_for(None, "user1", Utc::now()), ProblemView::NoProblem);
        assert_eq!(
            progress_for(Some(&problem()), "stranger", Utc::now()),
            ProblemView::NotParticipant
        );
    }

    #[test]
    fn partner_is_resolved_for_both_viewers() {
        let mut p = problem();
        p.sides.role_a.agreed_problem = true;

        let a = loaded(progress_for(Some(&p), "user1", Utc::now()));
        assert_eq!(a.my_role, Role::RoleA);
        assert_eq!(a.partner_role, Role::RoleB);
        assert_eq!(a.partner_id, "user2");
        assert_eq!(a.agreed_problem, StepProgress { mine: true, partner: false });

        let b = loaded(progress_for(Some(&p), "user2", Utc::now()));
        assert_eq!(b.my_role, Role::RoleB);
        assert_eq!(b.agreed_problem, StepProgress { mine: false, partner: true });
        assert_eq!(b.current_step, Some(Step::AgreedProblem));
    }

    #[test]
    fn text_steps_count_as_done_when_non_empty() {
        let mut p = problem();
        p.status = Phase::SolutionSteelman;
        p.sides.role_b.proposed_solution = "rota".to_string();
        p.sides.role_b.solution_steelman = "cleaner".to_string();
        let a = loaded(progress_for(Some(&p), "user1", Utc::now()));
        assert_eq!(a.proposed_solution, StepProgress { mine: false, partner: true });
        assert!(a.submitted_solution_steelman.partner);
        assert_eq!(a.current_step, Some(Step::SubmittedSolutionSteelman));
        assert!(!a.awaiting_checkpoint);
    }

    #[test]
    fn checkpoint_and_post_mortem_flags() {
        let now = Utc::now();
        let mut p = problem();
        p.status = Phase::AiReview;
        assert!(loaded(progress_for(Some(&p), "user1", now)).awaiting_checkpoint);

        p.status = Phase::Resolved;
        p.solution_check_date = Some(now + Duration::days(7));
        assert!(!loaded(progress_for(Some(&p), "user1", now)).post_mortem_open);
        assert!(
            loaded(progress_for(Some(&p), "user1", now + Duration::days(7))).post_mortem_open
        );
    }

    #[test]
    fn partner_private_text_hidden_until_translation() {
        let mut p = problem();
        p.status = Phase::PrivateVersions;
        p.sides.role_a.private_version = "mine".to_string();
        p.sides.role_b.private_version = "theirs".to_string();
        p.sides.role_b.translation = "blunt".to_string();

        let seen_by_a = redacted_for(&p, Role::RoleA);
        assert_eq!(seen_by_a.sides.role_a.private_version, "mine");
        assert!(seen_by_a.sides.role_b.private_version.is_empty());
        assert!(seen_by_a.sides.role_b.translation.is_empty());

        p.status = Phase::Translation;
        let revealed = redacted_for(&p, Role::RoleA);
        assert_eq!(revealed.sides.role_b.private_version, "theirs");
    }
}

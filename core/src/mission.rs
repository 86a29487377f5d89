//! The autonomous outer loop: repeated plan + execute sub-turns toward one
//! objective until completion, idleness or the step ceiling.

use pilot_protocol::EventPhase;
use pilot_protocol::EventStatus;
use pilot_protocol::ExecutionEvent;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;

use crate::context::RuntimeContext;
use crate::error::Result;
use crate::orchestrator::PassOptions;
use crate::orchestrator::TurnOutcome;
use crate::orchestrator::execute_passes;
use crate::orchestrator::plan_text_of;
use crate::orchestrator::write_plan_artifact;

pub const MISSION_COMPLETE_MARKER: &str = "MISSION COMPLETE";
/// After an idle abort, the force-action hint rides along for this many
/// further steps before the loop gives up.
const FORCE_ACTION_STEPS: u32 = 2;

#[derive(Debug, Clone)]
pub struct MissionContext {
    pub objective: String,
    pub step: u64,
    pub force_action: bool,
    pub plan_text: Option<String>,
}

impl MissionContext {
    pub fn to_value(&self) -> Value {
        json!({
            "objective": self.objective,
            "step": self.step,
            "force_action": self.force_action,
            "plan": self.plan_text,
        })
    }
}

/// Drive the orchestrator until the mission resolves. Each step is one
/// planning sub-turn (which writes a plan artifact) followed by one
/// execution sub-turn carrying the plan text.
pub(crate) async fn drive(ctx: &RuntimeContext, objective: &str) -> Result<TurnOutcome> {
    let config = ctx.config_snapshot();
    let max_steps = config.numerics.mission_max_steps.max(1);
    let idle_limit = config.numerics.mission_idle_limit.max(1);

    let mut idle_steps: u32 = 0;
    let mut force_steps_left: u32 = 0;
    let mut force_used = false;
    let mut last_outcome: Option<TurnOutcome> = None;

    for step in 1..=max_steps {
        let force_action = force_steps_left > 0;
        ctx.bus.emit(ExecutionEvent::new(
            EventPhase::Thinking,
            EventStatus::Progress,
            format!("mission step {step}/{max_steps}"),
        ));

        // Planning sub-turn.
        let plan_mission = MissionContext {
            objective: objective.to_string(),
            step,
            force_action,
            plan_text: None,
        };
        let plan_instruction = format!(
            "Plan the single next step toward this objective. If the objective is already \
             fully achieved, reply with the plan \"{MISSION_COMPLETE_MARKER}\".\n\nObjective: {objective}"
        );
        let plan_outcome = execute_passes(
            ctx,
            &plan_instruction,
            PassOptions {
                plan: true,
                fast: false,
                mission: Some(plan_mission),
            },
        )
        .await?;
        if let Err(err) = write_plan_artifact(ctx, objective, &plan_outcome.reply) {
            warn!("failed to write mission plan artifact: {err}");
        }

        let plan_text = plan_text_of(&plan_outcome.reply);
        if plan_outcome.reply.mission_complete
            || plan_text.trim().eq_ignore_ascii_case(MISSION_COMPLETE_MARKER)
        {
            info!("mission complete after {step} step(s) (planner)");
            return Ok(last_outcome.unwrap_or(plan_outcome));
        }

        // Execution sub-turn.
        let exec_mission = MissionContext {
            objective: objective.to_string(),
            step,
            force_action,
            plan_text: Some(plan_text.clone()),
        };
        let mut exec_instruction = format!("{objective}\n\n[MISSION PLAN]\n{plan_text}");
        if force_action {
            exec_instruction.push_str(
                "\n\n[FORCE ACTION]\nTake a concrete action this step: edit files or run commands.",
            );
        }
        let outcome = execute_passes(
            ctx,
            &exec_instruction,
            PassOptions {
                plan: false,
                fast: false,
                mission: Some(exec_mission),
            },
        )
        .await?;

        if outcome.reply.mission_complete {
            info!("mission complete after {step} step(s)");
            return Ok(outcome);
        }

        // Idle bookkeeping: tool steps reset the counter.
        let idle = outcome.is_idle();
        if idle {
            idle_steps += 1;
        } else {
            idle_steps = 0;
        }

        if force_steps_left > 0 {
            force_steps_left -= 1;
            if force_steps_left == 0 && idle {
                ctx.interaction
                    .notify("Mission ended: no progress even with forced action.");
                return Ok(outcome);
            }
        }

        if idle_steps >= idle_limit {
            if force_used {
                ctx.interaction
                    .notify("Mission ended: too many idle steps.");
                return Ok(outcome);
            }
            // One-time escalation: hint the model into concrete action for
            // the next two steps.
            force_used = true;
            force_steps_left = FORCE_ACTION_STEPS;
            idle_steps = 0;
        }

        last_outcome = Some(outcome);
    }

    ctx.interaction.notify("Mission ended: step ceiling reached.");
    match last_outcome {
        Some(outcome) => Ok(outcome),
        None => {
            // A zero-iteration mission cannot happen (max_steps >= 1), but
            // fall through to an empty turn rather than panic.
            execute_passes(
                ctx,
                objective,
                PassOptions {
                    plan: false,
                    fast: false,
                    mission: None,
                },
            )
            .await
        }
    }
}

//! Plan executor: recovery loop, rollback, verification, cancellation.
//!
//! Happy path: pre commands run block by block, one wire write each, so a
//! failed block is observed before the next is transmitted; then the main
//! commands go out as one batch with `stop_on_error`; then a verification
//! re-fetch (the diff against desired must come back empty); then post
//! commands. Each recognized failure pattern gets at most
//! `max_recovery_attempts` fixes before the plan is abandoned; abandonment
//! triggers rollback when the caller asked for it, and rollback runs with
//! its own recovery loop disabled.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::engine::planner::{CommandKind, CommandPlan, PlannedCommand, PlannedOp};
use crate::engine::recovery::{classify, extract_port, RecoveryAction};
use crate::error::{ErrorKind, RecoveryAttempt, Result};
use crate::handler::{DeviceHandler, VlanMembership};
use crate::model::{diff, ChangeTag, DesiredState, DeviceConfig};

/// Execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub stop_on_error: bool,
    pub rollback_on_error: bool,
    pub max_recovery_attempts: u32,
    pub cancel: CancellationToken,
    /// Deadline for one command.
    pub command_timeout: Duration,
    /// Deadline for a whole batch.
    pub batch_timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            stop_on_error: true,
            rollback_on_error: true,
            max_recovery_attempts: 3,
            cancel: CancellationToken::new(),
            command_timeout: Duration::from_secs(60),
            batch_timeout: Duration::from_secs(300),
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed { kind: ErrorKind, message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Outcome::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// Full account of one execution.
#[derive(Debug)]
pub struct ExecuteReport {
    pub outcome: Outcome,
    pub dry_run: bool,
    pub commands_executed: Vec<String>,
    pub recovery_trail: Vec<RecoveryAttempt>,
    pub rollback_performed: bool,
    /// Post-apply device state, captured by the verification fetch.
    pub after_state: Option<DeviceConfig>,
    /// Whether anything was written to the device.
    pub wire_writes: bool,
}

impl ExecuteReport {
    fn new(dry_run: bool) -> Self {
        Self {
            outcome: Outcome::Success,
            dry_run,
            commands_executed: Vec::new(),
            recovery_trail: Vec::new(),
            rollback_performed: false,
            after_state: None,
            wire_writes: false,
        }
    }
}

/// Execute a plan against a handler.
///
/// The caller must hold the device's writer lock for the duration of this
/// call; recovery re-enters the handler but never re-acquires locks.
pub async fn execute_plan(
    handler: &mut dyn DeviceHandler,
    plan: &CommandPlan,
    desired: &DesiredState,
    options: &ExecuteOptions,
) -> ExecuteReport {
    let mut report = ExecuteReport::new(options.dry_run);

    if options.dry_run {
        report.commands_executed = plan
            .render()
            .into_iter()
            .map(|c| format!("[DRY-RUN] {c}"))
            .collect();
        return report;
    }

    let mut executed_tags: HashSet<ChangeTag> = HashSet::new();
    let mut deferred_post: Vec<PlannedCommand> = Vec::new();

    // Pre commands run individually, one block per wire write: a failed
    // block must be observed before the next block's commands are ever
    // transmitted.
    for block in split_blocks(&plan.pre_commands) {
        debug!("executing pre block of {} commands", block.len());
        let result = run_phase(
            handler,
            block,
            options,
            true,
            &mut report,
            &mut executed_tags,
            &mut deferred_post,
        )
        .await;

        if let Err(outcome) = result {
            finish_failed(handler, plan, options, &executed_tags, outcome, &mut report).await;
            return report;
        }
    }

    // Main commands go out as one batch.
    if !plan.main_commands.is_empty() {
        debug!("executing {} main commands", plan.main_commands.len());
        let result = run_phase(
            handler,
            &plan.main_commands,
            options,
            true,
            &mut report,
            &mut executed_tags,
            &mut deferred_post,
        )
        .await;

        if let Err(outcome) = result {
            finish_failed(handler, plan, options, &executed_tags, outcome, &mut report).await;
            return report;
        }
    }

    // Verification: the device must now match the desired state.
    if report.wire_writes {
        match handler.get_config().await {
            Ok(current) => {
                let residual = diff(&current, desired);
                report.after_state = Some(current);
                if !residual.is_empty() {
                    let outcome = Outcome::failed(
                        ErrorKind::Protocol,
                        format!(
                            "verification found residual differences: {}",
                            residual.summarize()
                        ),
                    );
                    finish_failed(handler, plan, options, &executed_tags, outcome, &mut report)
                        .await;
                    return report;
                }
            }
            Err(e) => {
                warn!("verification fetch failed: {e}");
                let outcome = Outcome::failed(e.kind(), format!("verification fetch failed: {e}"));
                finish_failed(handler, plan, options, &executed_tags, outcome, &mut report).await;
                return report;
            }
        }
    }

    // Post commands and any deferred STP re-enables. Failures here are
    // logged, not fatal: the configuration itself already converged.
    if !deferred_post.is_empty() {
        if let Err(outcome) = run_phase(
            handler,
            &deferred_post.clone(),
            options,
            false,
            &mut report,
            &mut executed_tags,
            &mut Vec::new(),
        )
        .await
        {
            warn!("deferred post-command failed: {outcome:?}");
        }
    }
    for command in &plan.post_commands {
        if let Some(text) = command.cli_text() {
            match handler.execute(text).await {
                Ok(out) if out.is_success() => {
                    report.commands_executed.push(text.to_string());
                }
                Ok(out) => warn!("post-command '{text}' failed: {:?}", out.failure),
                Err(e) => warn!("post-command '{text}' errored: {e}"),
            }
        }
    }

    info!("plan executed: {} commands", report.commands_executed.len());
    report
}

/// One queued step plus the command that re-establishes its CLI context
/// (the `vlan <id>` / `interface ethe <p>` opener of its tag group).
#[derive(Clone)]
struct Step {
    command: PlannedCommand,
    context: Option<PlannedCommand>,
}

/// Whether a command opens a CLI sub-block.
fn opens_block(command: &PlannedCommand) -> bool {
    command
        .cli_text()
        .map(|t| t.starts_with("vlan ") || t.starts_with("interface "))
        .unwrap_or(false)
}

/// Split a phase into independent blocks, one per opener (an op entry is
/// its own block).
fn split_blocks(commands: &[PlannedCommand]) -> Vec<&[PlannedCommand]> {
    let mut blocks = Vec::new();
    let mut start = 0;
    for (i, command) in commands.iter().enumerate() {
        let boundary = opens_block(command) || matches!(command.kind, CommandKind::Op(_));
        if i > start && boundary {
            blocks.push(&commands[start..i]);
            start = i;
        }
    }
    if start < commands.len() {
        blocks.push(&commands[start..]);
    }
    blocks
}

/// Annotate commands with their group openers. Retrying a member command
/// after recovery must re-enter its block: a fresh batch starts outside
/// any vlan or interface context.
fn annotate(commands: &[PlannedCommand]) -> Vec<Step> {
    let mut steps = Vec::with_capacity(commands.len());
    let mut opener: Option<&PlannedCommand> = None;
    let mut opener_tag: Option<&ChangeTag> = None;

    for command in commands {
        if opener_tag != Some(&command.tag) || opens_block(command) {
            opener = Some(command);
            opener_tag = Some(&command.tag);
            steps.push(Step {
                command: command.clone(),
                context: None,
            });
        } else {
            steps.push(Step {
                command: command.clone(),
                context: opener.cloned(),
            });
        }
    }
    steps
}

/// Run one phase with the recovery loop. `Err` carries the final outcome.
#[allow(clippy::too_many_arguments)]
async fn run_phase(
    handler: &mut dyn DeviceHandler,
    commands: &[PlannedCommand],
    options: &ExecuteOptions,
    recovery_enabled: bool,
    report: &mut ExecuteReport,
    executed_tags: &mut HashSet<ChangeTag>,
    deferred_post: &mut Vec<PlannedCommand>,
) -> std::result::Result<(), Outcome> {
    let mut queue = annotate(commands);
    let mut index = 0;
    let mut recovery_budget = options.max_recovery_attempts;

    while index < queue.len() {
        if options.cancel.is_cancelled() {
            return Err(Outcome::failed(ErrorKind::Cancelled, "operation cancelled"));
        }

        match queue[index].command.kind.clone() {
            CommandKind::Cli(_) => {
                // run the contiguous CLI tail as one batch
                let cli_len = queue[index..]
                    .iter()
                    .take_while(|s| matches!(s.command.kind, CommandKind::Cli(_)))
                    .count();
                let texts: Vec<String> = queue[index..index + cli_len]
                    .iter()
                    .map(|s| s.command.cli_text().expect("cli run").to_string())
                    .collect();

                report.wire_writes = true;
                let results = tokio::time::timeout(
                    options.batch_timeout,
                    handler.execute_config_batch(&texts, options.stop_on_error, &options.cancel),
                )
                .await
                .map_err(|_| Outcome::failed(ErrorKind::Cancelled, "batch deadline exceeded"))?
                .map_err(|e| Outcome::failed(e.kind(), e.to_string()))?;

                let mut advanced = 0;
                let mut failure: Option<(usize, String, String)> = None;
                for (i, out) in results.iter().enumerate() {
                    if out.is_success() {
                        report.commands_executed.push(out.command.clone());
                        executed_tags.insert(queue[index + i].command.tag.clone());
                        advanced = i + 1;
                    } else {
                        failure = Some((
                            i,
                            out.command.clone(),
                            out.failure.clone().unwrap_or_default(),
                        ));
                        break;
                    }
                }

                let Some((failed_at, failed_cmd, failed_output)) = failure else {
                    if results.len() < texts.len() {
                        // the handler stopped early without a failure: cancelled
                        return Err(Outcome::failed(
                            ErrorKind::Cancelled,
                            "operation cancelled mid-batch",
                        ));
                    }
                    index += advanced;
                    continue;
                };

                if !recovery_enabled {
                    return Err(Outcome::failed(
                        ErrorKind::VendorReject,
                        format!("'{failed_cmd}' rejected: {failed_output}"),
                    ));
                }

                let action = classify(&failed_output).map(|(p, a)| (p.to_string(), a));
                let Some((pattern, action)) = action else {
                    return Err(Outcome::failed(
                        ErrorKind::VendorReject,
                        format!("'{failed_cmd}' rejected: {failed_output}"),
                    ));
                };

                if recovery_budget == 0 {
                    return Err(Outcome::failed(
                        ErrorKind::VendorReject,
                        format!("recovery exhausted at '{failed_cmd}': {failed_output}"),
                    ));
                }
                recovery_budget -= 1;

                let succeeded = apply_recovery(
                    handler,
                    &action,
                    &failed_cmd,
                    &failed_output,
                    options,
                    deferred_post,
                )
                .await;
                report.recovery_trail.push(RecoveryAttempt {
                    pattern,
                    action: action.as_str().to_string(),
                    command: failed_cmd.clone(),
                    succeeded,
                });

                let failed_index = index + failed_at;
                match action {
                    RecoveryAction::AlreadyApplied => {
                        // idempotent no-op: count it as done and move past
                        // it, re-opening the block for its remaining members
                        report.commands_executed.push(failed_cmd);
                        executed_tags.insert(queue[failed_index].command.tag.clone());
                        let reopen = queue.get(failed_index + 1).and_then(|next| {
                            (next.command.tag == queue[failed_index].command.tag)
                                .then(|| queue[failed_index].context.clone())
                                .flatten()
                        });
                        index = failed_index + 1;
                        if let Some(opener) = reopen {
                            queue.insert(
                                index,
                                Step {
                                    command: opener,
                                    context: None,
                                },
                            );
                        }
                    }
                    RecoveryAction::Fatal => {
                        return Err(Outcome::failed(
                            ErrorKind::VendorReject,
                            format!("'{failed_cmd}' rejected: {failed_output}"),
                        ));
                    }
                    _ if succeeded => {
                        // retry the failed command, re-entering its block
                        if let Some(opener) = queue[failed_index].context.clone() {
                            queue.insert(
                                failed_index,
                                Step {
                                    command: opener,
                                    context: None,
                                },
                            );
                        }
                        index = failed_index;
                    }
                    _ => {
                        return Err(Outcome::failed(
                            ErrorKind::VendorReject,
                            format!("recovery for '{failed_cmd}' failed: {failed_output}"),
                        ));
                    }
                }
            }

            CommandKind::Op(op) => {
                let tag = queue[index].command.tag.clone();
                report.wire_writes = true;
                let result = tokio::time::timeout(
                    options.command_timeout,
                    dispatch_op(handler, &op),
                )
                .await
                .map_err(|_| Outcome::failed(ErrorKind::Cancelled, "command deadline exceeded"))?;

                match result {
                    Ok(()) => {
                        report.commands_executed.push(describe_op(&op));
                        executed_tags.insert(tag);
                        index += 1;
                    }
                    Err(e) => {
                        // idempotent rejections are successes
                        if recovery_enabled
                            && matches!(
                                classify(&e.to_string()),
                                Some((_, RecoveryAction::AlreadyApplied))
                            )
                        {
                            report.recovery_trail.push(RecoveryAttempt {
                                pattern: "already a member".into(),
                                action: RecoveryAction::AlreadyApplied.as_str().into(),
                                command: describe_op(&op),
                                succeeded: true,
                            });
                            executed_tags.insert(tag);
                            index += 1;
                            continue;
                        }
                        return Err(Outcome::failed(e.kind(), e.to_string()));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Execute the fix for a recognized pattern. Returns whether the fix ran.
async fn apply_recovery(
    handler: &mut dyn DeviceHandler,
    action: &RecoveryAction,
    failed_cmd: &str,
    failed_output: &str,
    options: &ExecuteOptions,
    deferred_post: &mut Vec<PlannedCommand>,
) -> bool {
    match action {
        RecoveryAction::DisableDualMode => {
            let Some(port) = extract_port(failed_output, failed_cmd) else {
                return false;
            };
            info!("recovery: disabling dual-mode on {port}");
            let fix = vec![
                format!("interface ethe {port}"),
                "no dual-mode".to_string(),
                "exit".to_string(),
            ];
            handler
                .execute_config_batch(&fix, true, &options.cancel)
                .await
                .map(|results| results.iter().all(|r| r.is_success()))
                .unwrap_or(false)
        }
        RecoveryAction::DisableStp => {
            let Some(port) = extract_port(failed_output, failed_cmd) else {
                return false;
            };
            info!("recovery: disabling spanning-tree on {port}");
            let fix = vec![
                format!("interface ethe {port}"),
                "no spanning-tree".to_string(),
                "exit".to_string(),
            ];
            let ok = handler
                .execute_config_batch(&fix, true, &options.cancel)
                .await
                .map(|results| results.iter().all(|r| r.is_success()))
                .unwrap_or(false);
            if ok {
                // undo in post once the plan has gone through
                deferred_post.push(PlannedCommand::cli(
                    format!("interface ethe {port}"),
                    ChangeTag::Meta,
                ));
                deferred_post.push(PlannedCommand::cli("spanning-tree", ChangeTag::Meta));
                deferred_post.push(PlannedCommand::cli("exit", ChangeTag::Meta));
            }
            ok
        }
        RecoveryAction::Reconnect => {
            warn!("recovery: session lost, reconnecting");
            if handler.disconnect().await.is_err() {
                return false;
            }
            handler.connect().await.is_ok()
        }
        RecoveryAction::AlreadyApplied | RecoveryAction::Fatal => true,
    }
}

async fn dispatch_op(handler: &mut dyn DeviceHandler, op: &PlannedOp) -> Result<()> {
    match op {
        PlannedOp::CreateVlan(vlan) => handler.create_vlan(vlan).await,
        PlannedOp::DeleteVlan(id) => handler.delete_vlan(*id).await,
        PlannedOp::SetMembership { vlan, port, tagged } => {
            let membership = if *tagged {
                VlanMembership::Tagged
            } else {
                VlanMembership::Untagged
            };
            handler.set_vlan_membership(*vlan, port, membership).await
        }
        PlannedOp::ClearMembership { vlan, port } => {
            handler
                .set_vlan_membership(*vlan, port, VlanMembership::Excluded)
                .await
        }
        PlannedOp::ConfigurePort(port) => handler.configure_port(port).await,
    }
}

fn describe_op(op: &PlannedOp) -> String {
    match op {
        PlannedOp::CreateVlan(vlan) => format!("create vlan {}", vlan.id),
        PlannedOp::DeleteVlan(id) => format!("delete vlan {id}"),
        PlannedOp::SetMembership { vlan, port, tagged } => {
            format!(
                "vlan {vlan}: set {port} {}",
                if *tagged { "tagged" } else { "untagged" }
            )
        }
        PlannedOp::ClearMembership { vlan, port } => format!("vlan {vlan}: clear {port}"),
        PlannedOp::ConfigurePort(port) => format!("configure port {}", port.id),
    }
}

/// Handle a failed phase: roll back what ran, then finalize the outcome.
async fn finish_failed(
    handler: &mut dyn DeviceHandler,
    plan: &CommandPlan,
    options: &ExecuteOptions,
    executed_tags: &HashSet<ChangeTag>,
    outcome: Outcome,
    report: &mut ExecuteReport,
) {
    let wants_rollback =
        options.rollback_on_error && report.wire_writes && !plan.rollback_commands.is_empty();

    if !wants_rollback {
        report.outcome = outcome;
        return;
    }

    // Only unwind what actually ran; Meta steps (commits, reloads) always
    // run so the unwind itself takes effect.
    let to_run: Vec<PlannedCommand> = plan
        .rollback_commands
        .iter()
        .filter(|c| c.tag == ChangeTag::Meta || executed_tags.contains(&c.tag))
        .cloned()
        .collect();

    if to_run.is_empty() {
        report.outcome = outcome;
        return;
    }

    warn!("rolling back {} commands after failure", to_run.len());
    let rollback_cancel = ExecuteOptions {
        cancel: CancellationToken::new(),
        stop_on_error: false,
        ..options.clone()
    };

    let mut rollback_report = ExecuteReport::new(false);
    let mut rollback_tags = HashSet::new();
    let result = run_phase(
        handler,
        &to_run,
        &rollback_cancel,
        false,
        &mut rollback_report,
        &mut rollback_tags,
        &mut Vec::new(),
    )
    .await;

    report
        .commands_executed
        .extend(rollback_report.commands_executed);

    match result {
        Ok(()) => {
            report.rollback_performed = true;
            report.outcome = outcome;
        }
        Err(rollback_outcome) => {
            let reason = match rollback_outcome {
                Outcome::Failed { message, .. } => message,
                Outcome::Success => unreachable!("Err carries a failure"),
            };
            report.outcome = Outcome::failed(
                ErrorKind::RollbackFailed,
                format!("{}; rollback also failed: {reason}", failure_message(&outcome)),
            );
        }
    }
}

fn failure_message(outcome: &Outcome) -> &str {
    match outcome {
        Outcome::Failed { message, .. } => message,
        Outcome::Success => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(text: &str, tag: ChangeTag) -> PlannedCommand {
        PlannedCommand::cli(text, tag)
    }

    #[test]
    fn pre_blocks_split_at_openers() {
        let commands = vec![
            cli("interface ethe 1/1/10", ChangeTag::Meta),
            cli("no dual-mode", ChangeTag::Meta),
            cli("exit", ChangeTag::Meta),
            cli("interface ethe 1/2/1", ChangeTag::Meta),
            cli("no dual-mode", ChangeTag::Meta),
            cli("exit", ChangeTag::Meta),
        ];
        let blocks = split_blocks(&commands);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), 3);
        assert_eq!(blocks[1][0].cli_text(), Some("interface ethe 1/2/1"));
    }

    #[test]
    fn empty_phase_has_no_blocks() {
        assert!(split_blocks(&[]).is_empty());
    }

    #[test]
    fn annotate_records_block_openers_as_context() {
        let commands = vec![
            cli("vlan 100 name Servers by port", ChangeTag::VlanCreate(100)),
            cli("untagged ethe 1/1/5 to 1/1/8", ChangeTag::VlanCreate(100)),
            cli("exit", ChangeTag::VlanCreate(100)),
        ];
        let steps = annotate(&commands);
        assert!(steps[0].context.is_none());
        assert_eq!(
            steps[1].context.as_ref().and_then(|c| c.cli_text()),
            Some("vlan 100 name Servers by port")
        );
    }
}

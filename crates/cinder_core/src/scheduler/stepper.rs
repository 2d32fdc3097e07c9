use cinder_error::{DbError, OptionExt, Result};
use tracing::trace;

use super::Scheduler;
use crate::fork::{ForkContext, NodeState};
use crate::graph::expr::Variables;
use crate::graph::{NodeId, NodeKind, QueryGraph};
use crate::ops::{LockStatus, OpOutcome, OperatorContext, RowOpState};
use crate::thread::{ActiveThread, Continuation, ThreadState};
use crate::trx::signal::SignalKind;

/// What the run loop does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep stepping the same thread.
    Continue,
    /// The thread wants to stop, release it.
    Release,
}

/// Continuation for entering a block, returning to its owner if empty.
fn enter_block(first: Option<NodeId>, owner: NodeId) -> Continuation {
    match first {
        Some(first) => Continuation::Enter(first),
        None => Continuation::Resume(owner),
    }
}

/// Continuation after a statement finished.
fn advance(graph: &QueryGraph, id: NodeId) -> Continuation {
    let node = graph.node(id);
    match node.next {
        Some(next) => Continuation::Enter(next),
        None => Continuation::Resume(node.parent.expect("statement to have a parent")),
    }
}

impl Scheduler {
    /// Advance a thread by one node.
    ///
    /// Never blocks. Errors are recorded against the transaction and the
    /// thread is released.
    pub fn step(&self, thread: &mut ActiveThread) -> Step {
        let graph = thread.graph.clone();
        let (id, entering) = match thread.cursor.continuation {
            Continuation::Enter(id) => (id, true),
            Continuation::Resume(id) => (id, false),
        };
        trace!(thread = %thread.id, node = %id, entering, tag = ?graph.tag(id), "step");

        let result = self.step_node(thread, &graph, id, entering);
        thread.cursor.prev = Some(id);
        thread.resource += 1;

        match result {
            Ok(step) => step,
            Err(e) => {
                trace!(thread = %thread.id, node = %id, %e, "step failed");
                self.record_error(thread.trx, e.with_field("node", id));
                Step::Release
            }
        }
    }

    fn step_node(
        &self,
        thread: &mut ActiveThread,
        graph: &QueryGraph,
        id: NodeId,
        entering: bool,
    ) -> Result<Step> {
        let cont = &mut thread.cursor.continuation;

        match &graph.node(id).kind {
            NodeKind::Fork { .. } => panic!("{} positioned at the fork node", thread.id),
            NodeKind::Thread { body } => {
                if entering {
                    *cont = enter_block(*body, id);
                    return Ok(Step::Continue);
                }
                let mut state = self.lock();
                if !self.stop_predicate(&mut state, thread.id) {
                    state.thread_mut(thread.id).state = ThreadState::Completed;
                }
                Ok(Step::Release)
            }
            NodeKind::Assignment { var, expr } => {
                let val = expr.eval(&thread.ctx.vars)?;
                thread.ctx.vars.insert(var.clone(), val);
                *cont = advance(graph, id);
                Ok(Step::Continue)
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                *cont = if !entering {
                    advance(graph, id)
                } else if cond.eval_bool(&thread.ctx.vars)? {
                    enter_block(*then_branch, id)
                } else {
                    enter_block(*else_branch, id)
                };
                Ok(Step::Continue)
            }
            NodeKind::While { cond, body } => {
                *cont = if cond.eval_bool(&thread.ctx.vars)? {
                    enter_block(*body, id)
                } else {
                    advance(graph, id)
                };
                Ok(Step::Continue)
            }
            NodeKind::For {
                var,
                from,
                to,
                body,
            } => {
                let ForkContext { vars, node_states } = &mut thread.ctx;
                let (val, end) = if entering {
                    let start = from.eval(vars)?;
                    let end = to.eval(vars)?;
                    node_states[id.0] = NodeState::For { end };
                    (start, end)
                } else {
                    let end = match &node_states[id.0] {
                        NodeState::For { end } => *end,
                        other => panic!("unexpected state for loop {id}: {other:?}"),
                    };
                    let curr = vars.get(var).copied().required("loop variable")?;
                    let next = curr.checked_add(1).ok_or_else(|| {
                        DbError::new("Loop variable overflow").with_field("var", var)
                    })?;
                    (next, end)
                };

                if val > end {
                    *cont = advance(graph, id);
                } else {
                    vars.insert(var.clone(), val);
                    *cont = enter_block(*body, id);
                }
                Ok(Step::Continue)
            }
            NodeKind::Exit => {
                let lp = graph.innermost_loop(id).required("loop to exit")?;
                *cont = advance(graph, lp);
                Ok(Step::Continue)
            }
            NodeKind::Return => {
                *cont = Continuation::Resume(graph.thread_node_of(id));
                Ok(Step::Continue)
            }
            NodeKind::ProcedureCall { procedure, args } => {
                if !entering {
                    *cont = advance(graph, id);
                    return Ok(Step::Continue);
                }
                let mut callee_vars = Variables::with_capacity(args.len());
                for (name, expr) in args {
                    callee_vars.insert(name.clone(), expr.eval(&thread.ctx.vars)?);
                }
                *cont = Continuation::Resume(id);
                self.prepare_call(thread, procedure.clone(), callee_vars);
                Ok(Step::Release)
            }
            NodeKind::Commit | NodeKind::Rollback => {
                if !entering {
                    *cont = advance(graph, id);
                    return Ok(Step::Continue);
                }
                let kind = match graph.node(id).kind {
                    NodeKind::Commit => SignalKind::CommitRequested,
                    _ => SignalKind::RollbackRequested,
                };
                self.send_signal_from(thread, kind)?;
                thread.cursor.continuation = Continuation::Resume(id);
                Ok(Step::Release)
            }
            NodeKind::Lock { table, mode } => match self.acquire_lock(thread.trx, *table, *mode) {
                LockStatus::Granted => {
                    *cont = advance(graph, id);
                    Ok(Step::Continue)
                }
                LockStatus::WouldWait(_) => {
                    *cont = Continuation::Resume(id);
                    Ok(Step::Release)
                }
            },
            NodeKind::RowOperation(op) => {
                let ForkContext { vars, node_states } = &mut thread.ctx;
                if entering || !matches!(node_states[id.0], NodeState::Row(_)) {
                    node_states[id.0] = NodeState::Row(RowOpState::default());
                }
                let NodeState::Row(op_state) = &mut node_states[id.0] else {
                    unreachable!("row state set above")
                };
                op_state.calls += 1;

                let mut cx = OperatorContext {
                    scheduler: self,
                    thread: thread.id,
                    trx: thread.trx,
                    vars,
                };
                let outcome = self.row_operator.step(op, op_state, &mut cx)?;

                let cont = &mut thread.cursor.continuation;
                match outcome {
                    OpOutcome::Done => {
                        *cont = advance(graph, id);
                        Ok(Step::Continue)
                    }
                    OpOutcome::Again => {
                        *cont = Continuation::Resume(id);
                        Ok(Step::Continue)
                    }
                    OpOutcome::Stop => {
                        *cont = Continuation::Resume(id);
                        Ok(Step::Release)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::graph::expr::Expr;
    use crate::ops::CommandReply;
    use crate::testutil::{new_test_scheduler, test_collaborators};
    use crate::trx::Driver;

    fn assign(var: &str, expr: Expr) -> NodeKind {
        NodeKind::Assignment {
            var: var.to_string(),
            expr,
        }
    }

    #[test]
    fn control_flow() {
        let mut b = GraphBuilder::new("control_flow");
        let thread = b.add_thread();
        b.push(thread, assign("x", Expr::lit(0))).unwrap();
        let lp = b
            .push(
                thread,
                NodeKind::For {
                    var: "i".to_string(),
                    from: Expr::lit(1),
                    to: Expr::lit(5),
                    body: None,
                },
            )
            .unwrap();
        let check = b
            .push(
                lp,
                NodeKind::If {
                    cond: Expr::var("i").eq(Expr::lit(3)),
                    then_branch: None,
                    else_branch: None,
                },
            )
            .unwrap();
        b.push(check, NodeKind::Exit).unwrap();
        b.push(lp, assign("x", Expr::var("x").add(Expr::var("i"))))
            .unwrap();

        let branch = b
            .push(
                thread,
                NodeKind::If {
                    cond: Expr::var("x").eq(Expr::lit(3)),
                    then_branch: None,
                    else_branch: None,
                },
            )
            .unwrap();
        b.push(branch, assign("y", Expr::lit(1))).unwrap();
        b.push_else(branch, assign("y", Expr::lit(2))).unwrap();

        let empty = b
            .push(
                thread,
                NodeKind::For {
                    var: "j".to_string(),
                    from: Expr::lit(5),
                    to: Expr::lit(1),
                    body: None,
                },
            )
            .unwrap();
        b.push(empty, assign("q", Expr::lit(1))).unwrap();

        b.push(thread, assign("w", Expr::lit(0))).unwrap();
        let wl = b
            .push(
                thread,
                NodeKind::While {
                    cond: Expr::var("w").lt(Expr::lit(3)),
                    body: None,
                },
            )
            .unwrap();
        b.push(wl, assign("w", Expr::var("w").add(Expr::lit(1))))
            .unwrap();
        b.push(thread, NodeKind::Return).unwrap();
        b.push(thread, assign("z", Expr::lit(99))).unwrap();
        let graph = b.build().unwrap();

        let (scheduler, _) = new_test_scheduler(test_collaborators());
        let trx = scheduler.begin_transaction(Driver::Pool);
        let reply = CommandReply::new();
        let fork = scheduler.create_fork(trx, graph, reply.clone()).unwrap();
        let mut active = scheduler.start_command(fork).unwrap();

        let mut steps = 0;
        while scheduler.step(&mut active) == Step::Continue {
            steps += 1;
            assert!(steps < 1000, "thread never finished");
        }

        assert_eq!(Some(3), active.var("x"));
        assert_eq!(Some(3), active.var("i"));
        assert_eq!(Some(1), active.var("y"));
        assert_eq!(None, active.var("q"));
        assert_eq!(Some(3), active.var("w"));
        assert_eq!(None, active.var("z"));
        assert_eq!(Continuation::Resume(thread), active.cursor().continuation);
        assert_eq!(Some(thread), active.cursor().prev);
        assert_eq!(steps + 1, active.resource());

        assert!(scheduler.release(active).is_none());
        reply.try_take().unwrap().into_result().unwrap();
    }

    #[test]
    fn empty_thread_completes() {
        let mut b = GraphBuilder::new("empty_thread");
        b.add_thread();
        let graph = b.build().unwrap();

        let (scheduler, _) = new_test_scheduler(test_collaborators());
        let trx = scheduler.begin_transaction(Driver::Pool);
        let reply = CommandReply::new();
        let fork = scheduler.create_fork(trx, graph, reply.clone()).unwrap();
        let mut active = scheduler.start_command(fork).unwrap();

        assert_eq!(Step::Continue, scheduler.step(&mut active));
        assert_eq!(Step::Release, scheduler.step(&mut active));
        assert!(scheduler.release(active).is_none());
        reply.try_take().unwrap().into_result().unwrap();
    }

    #[test]
    fn eval_error_fails_command() {
        let mut b = GraphBuilder::new("bad_var");
        let thread = b.add_thread();
        let bad = b.push(thread, assign("x", Expr::var("missing"))).unwrap();
        let graph = b.build().unwrap();

        let (scheduler, collab) = new_test_scheduler(test_collaborators());
        let trx = scheduler.begin_transaction(Driver::Pool);
        let reply = CommandReply::new();
        let fork = scheduler.create_fork(trx, graph, reply.clone()).unwrap();
        let mut active = scheduler.start_command(fork).unwrap();

        assert_eq!(Step::Continue, scheduler.step(&mut active));
        assert_eq!(Step::Release, scheduler.step(&mut active));
        assert_eq!(Some(bad), active.cursor().prev);

        let next = scheduler.release(active).unwrap();
        scheduler.run_threads(next);

        let err = reply.try_take().unwrap().into_result().unwrap_err();
        assert_eq!("Unknown variable", err.get_msg());
        assert_eq!(Some("missing"), err.get_field("name"));
        assert_eq!(Some(bad.to_string().as_str()), err.get_field("node"));
        assert_eq!(1, collab.signals.counts().errors);
        scheduler.validate().unwrap();
    }
}

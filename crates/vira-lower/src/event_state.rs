//! Initialize-event-state pass and the event-safety check.
//!
//! Every DMA transfer is issued on a hardware queue and tracked by one event
//! register of that queue. The pass assigns queues and registers, then
//! inserts waits so that:
//!
//! * nothing touches a transfer's destination, or overwrites its source,
//!   before the wait on its event;
//! * a queue never has more transfers outstanding than it has registers
//!   (the oldest one is waited on first);
//! * loop and conditional bodies leave nothing outstanding, and neither does
//!   the function.
//!
//! A loop or conditional that issues transfers of its own first waits on
//! everything outstanding.

use std::collections::BTreeMap;

use vira_ir::{
    Buffer, BufferEffects, DmaTransfer, Event, EventSlot, EventState, Expr, Function, Handle,
    PropertySet, Stmt, StmtPath,
};
use vira_target::TargetDescriptor;

use crate::util::seq;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct InitializeEventState;

impl Pass for InitializeEventState {
    fn name(&self) -> &'static str {
        "initialize-event-state"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::DMA_INSERTED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::EVENTS_INITIALIZED
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let mut sched = Scheduler {
            buffers: &func.buffers,
            events: &func.events,
            target: cx.target,
            slots: vec![None; func.events.len()],
            new_events: Vec::new(),
            max_in_flight: 0,
            waits: 0,
        };
        let mut pending = Vec::new();
        let mut out = sched
            .stmt(body, &mut pending)
            .map_err(|m| cx.invariant(&StmtPath::root(), m))?;
        sched.drain(&mut pending, &mut out);

        let Scheduler {
            slots,
            new_events,
            max_in_flight,
            waits,
            ..
        } = sched;
        log::debug!(
            "`{}`: {} event(s), {waits} wait(s), at most {max_in_flight} in flight per queue",
            func.name,
            slots.len()
        );
        for event in new_events {
            func.events.append(event);
        }
        let slots = slots
            .into_iter()
            .map(|slot| slot.unwrap_or(EventSlot { queue: 0, slot: 0 }))
            .collect();
        func.event_state = Some(EventState {
            slots,
            max_in_flight,
        });
        func.body = seq(out);
        Ok(func)
    }
}

/// A transfer issued but not yet waited on.
#[derive(Clone, Copy, Debug)]
struct InFlight {
    event: Handle<Event>,
    queue: u32,
    slot: u32,
    src: Handle<Buffer>,
    dst: Handle<Buffer>,
}

impl InFlight {
    /// Running something with `effects` now would race with the transfer.
    fn races_with(&self, effects: &BufferEffects) -> bool {
        effects.touches(self.dst) || effects.writes.contains(&self.src)
    }
}

struct Scheduler<'a> {
    buffers: &'a vira_ir::Arena<Buffer>,
    events: &'a vira_ir::Arena<Event>,
    target: &'a TargetDescriptor,
    /// Indexed by event handle; covers `events` followed by `new_events`.
    slots: Vec<Option<EventSlot>>,
    new_events: Vec<Event>,
    max_in_flight: u32,
    waits: usize,
}

impl Scheduler<'_> {
    fn stmt(&mut self, stmt: Stmt, pending: &mut Vec<InFlight>) -> Result<Vec<Stmt>, String> {
        let mut out = Vec::new();
        if matches!(stmt, Stmt::For(_) | Stmt::If { .. }) {
            self.enter(&stmt, pending, &mut out);
        }
        match stmt {
            Stmt::Seq(stmts) => {
                for s in stmts {
                    out.extend(self.stmt(s, pending)?);
                }
            }
            Stmt::Dma(dma) => {
                let dma = self.issue(dma, pending, &mut out)?;
                out.push(Stmt::Dma(dma));
            }
            Stmt::Wait(event) => {
                pending.retain(|f| f.event != event);
                out.push(Stmt::Wait(event));
            }
            Stmt::Let { var, value, body } => {
                let effects = Stmt::Evaluate(value.clone()).buffer_effects();
                self.wait_where(pending, &mut out, |f| f.races_with(&effects));
                let body = self.stmt(*body, pending)?;
                out.push(Stmt::let_(var, value, seq(body)));
            }
            Stmt::For(mut l) => {
                l.body = Box::new(self.block(*l.body)?);
                out.push(Stmt::For(l));
            }
            Stmt::If {
                condition,
                then_case,
                else_case,
            } => {
                let then_case = Box::new(self.block(*then_case)?);
                let else_case = else_case.map(|e| self.block(*e).map(Box::new)).transpose()?;
                out.push(Stmt::If {
                    condition,
                    then_case,
                    else_case,
                });
            }
            leaf => {
                let effects = leaf.buffer_effects();
                self.wait_where(pending, &mut out, |f| f.races_with(&effects));
                out.push(leaf);
            }
        }
        Ok(out)
    }

    /// Waits required before a loop or conditional starts.
    fn enter(&mut self, stmt: &Stmt, pending: &mut Vec<InFlight>, out: &mut Vec<Stmt>) {
        if contains_dma(stmt) {
            self.drain(pending, out);
        } else {
            let effects = stmt.buffer_effects();
            self.wait_where(pending, out, |f| f.races_with(&effects));
        }
    }

    /// A nested body with its own, initially empty, set of transfers.
    fn block(&mut self, body: Stmt) -> Result<Stmt, String> {
        let mut pending = Vec::new();
        let mut out = self.stmt(body, &mut pending)?;
        self.drain(&mut pending, &mut out);
        Ok(seq(out))
    }

    fn issue(
        &mut self,
        mut dma: DmaTransfer,
        pending: &mut Vec<InFlight>,
        out: &mut Vec<Stmt>,
    ) -> Result<DmaTransfer, String> {
        let space = |b: Handle<Buffer>| {
            self.buffers
                .try_get(b)
                .map(|buf| buf.space)
                .ok_or_else(|| format!("DMA names unknown buffer #{}", b.index()))
        };
        let queue = self.target.dma_queue(space(dma.src.buffer)?, space(dma.dst.buffer)?);

        // Hazards with transfers already in flight.
        let (src, dst) = (dma.src.buffer, dma.dst.buffer);
        self.wait_where(pending, out, |f| f.dst == src || f.dst == dst || f.src == dst);

        let capacity = self.target.max_events_per_queue.max(1);
        if on_queue(pending, queue) >= capacity as usize
            && let Some(oldest) = pending.iter().position(|f| f.queue == queue)
        {
            let f = pending.remove(oldest);
            log::trace!("queue {queue} full, waiting on `{}` early", self.event_name(f.event));
            out.push(Stmt::Wait(f.event));
            self.waits += 1;
        }
        let slot = (0..capacity)
            .find(|s| !pending.iter().any(|f| f.queue == queue && f.slot == *s))
            .ok_or_else(|| format!("no free event register on queue {queue}"))?;

        if matches!(self.slots.get(dma.event.index()), Some(Some(_))) {
            // The same transfer was duplicated by an earlier pass.
            dma.event = self.fresh_event(dma.event);
        }
        let entry = self
            .slots
            .get_mut(dma.event.index())
            .ok_or_else(|| format!("DMA names unknown event #{}", dma.event.index()))?;
        *entry = Some(EventSlot { queue, slot });

        pending.push(InFlight {
            event: dma.event,
            queue,
            slot,
            src,
            dst,
        });
        self.max_in_flight = self.max_in_flight.max(on_queue(pending, queue) as u32);
        Ok(dma)
    }

    fn fresh_event(&mut self, of: Handle<Event>) -> Handle<Event> {
        let handle = Handle::new(self.slots.len() as u32);
        let name = format!("{}_{}", self.event_name(of), handle.index());
        self.new_events.push(Event { name });
        self.slots.push(None);
        handle
    }

    fn event_name(&self, event: Handle<Event>) -> String {
        match self.events.try_get(event) {
            Some(e) => e.name.clone(),
            None => self
                .new_events
                .get(event.index().wrapping_sub(self.events.len()))
                .map_or_else(|| format!("#{}", event.index()), |e| e.name.clone()),
        }
    }

    fn wait_where(
        &mut self,
        pending: &mut Vec<InFlight>,
        out: &mut Vec<Stmt>,
        mut pred: impl FnMut(&InFlight) -> bool,
    ) {
        pending.retain(|f| {
            if pred(f) {
                out.push(Stmt::Wait(f.event));
                self.waits += 1;
                false
            } else {
                true
            }
        });
    }

    fn drain(&mut self, pending: &mut Vec<InFlight>, out: &mut Vec<Stmt>) {
        self.wait_where(pending, out, |_| true);
    }
}

fn on_queue(pending: &[InFlight], queue: u32) -> usize {
    pending.iter().filter(|f| f.queue == queue).count()
}

fn contains_dma(stmt: &Stmt) -> bool {
    let mut found = false;
    let _ = stmt.walk::<()>(&mut StmtPath::root(), &mut |s, _| {
        found |= matches!(s, Stmt::Dma(_));
        Ok(())
    });
    found
}

/// Outstanding transfers by event index: `(src, dst)`.
type Pending = BTreeMap<usize, (Handle<Buffer>, Handle<Buffer>)>;

/// Checks that on every path, every access to a transfer's destination (and
/// every overwrite of its source) comes after the wait on its event, and that
/// nothing is left outstanding when the function returns.
pub(crate) fn check_event_safety(func: &Function) -> Result<(), (StmtPath, String)> {
    let checker = SafetyCheck { func };
    let mut path = StmtPath::root();
    let pending = checker.stmt(&func.body, Pending::new(), &mut path)?;
    match pending.keys().next() {
        Some(&event) => Err((
            StmtPath::root(),
            format!("`{}` is never waited on", checker.name(event)),
        )),
        None => Ok(()),
    }
}

struct SafetyCheck<'a> {
    func: &'a Function,
}

impl SafetyCheck<'_> {
    fn name(&self, event: usize) -> String {
        self.func
            .events
            .try_get(Handle::new(event as u32))
            .map_or_else(|| format!("#{event}"), |e| e.name.clone())
    }

    fn access(
        &self,
        effects: &BufferEffects,
        pending: &Pending,
        path: &StmtPath,
    ) -> Result<(), (StmtPath, String)> {
        for (&event, &(src, dst)) in pending {
            let clash = if effects.touches(dst) {
                Some(dst)
            } else if effects.writes.contains(&src) {
                Some(src)
            } else {
                None
            };
            if let Some(buffer) = clash {
                let buffer = self
                    .func
                    .buffers
                    .try_get(buffer)
                    .map_or("?", |b| b.name.as_str());
                return Err((
                    path.clone(),
                    format!("`{buffer}` accessed before waiting on `{}`", self.name(event)),
                ));
            }
        }
        Ok(())
    }

    fn exprs(
        &self,
        exprs: &[&Expr],
        pending: &Pending,
        path: &StmtPath,
    ) -> Result<(), (StmtPath, String)> {
        let stmts = exprs.iter().map(|e| Stmt::Evaluate((*e).clone())).collect();
        self.access(&Stmt::Seq(stmts).buffer_effects(), pending, path)
    }

    fn child(
        &self,
        stmt: &Stmt,
        index: u32,
        pending: Pending,
        path: &mut StmtPath,
    ) -> Result<Pending, (StmtPath, String)> {
        path.push(index);
        let res = self.stmt(stmt, pending, path);
        path.pop();
        res
    }

    fn stmt(
        &self,
        stmt: &Stmt,
        mut pending: Pending,
        path: &mut StmtPath,
    ) -> Result<Pending, (StmtPath, String)> {
        match stmt {
            Stmt::Seq(stmts) => {
                for (i, s) in stmts.iter().enumerate() {
                    pending = self.child(s, i as u32, pending, path)?;
                }
            }
            Stmt::Dma(dma) => {
                self.access(&stmt.buffer_effects(), &pending, path)?;
                let event = dma.event.index();
                if pending.insert(event, (dma.src.buffer, dma.dst.buffer)).is_some() {
                    return Err((
                        path.clone(),
                        format!("`{}` reissued before it was waited on", self.name(event)),
                    ));
                }
            }
            Stmt::Wait(event) => {
                pending.remove(&event.index());
            }
            Stmt::Signal(_) => {}
            Stmt::Let { value, body, .. } => {
                self.exprs(&[value], &pending, path)?;
                pending = self.child(body, 0, pending, path)?;
            }
            Stmt::If {
                condition,
                then_case,
                else_case,
            } => {
                self.exprs(&[condition], &pending, path)?;
                let mut joined = self.child(then_case, 0, pending.clone(), path)?;
                let other = match else_case {
                    Some(e) => self.child(e, 1, pending, path)?,
                    None => pending,
                };
                joined.extend(other);
                pending = joined;
            }
            Stmt::For(l) => {
                self.exprs(&[&l.min, &l.extent], &pending, path)?;
                // Gen/kill sets reach their fixpoint after two iterations.
                let mut state = pending.clone();
                for _ in 0..2 {
                    let after = self.child(&l.body, 0, state.clone(), path)?;
                    state.extend(after);
                }
                pending = state;
            }
            leaf => self.access(&leaf.buffer_effects(), &pending, path)?,
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass_on;
    use crate::testing::target;
    use vira_ir::{AddressSpace, DataType, DmaDim, DmaEndpoint, Loop, Var};

    struct Kernel {
        func: Function,
        globals: Vec<Handle<Buffer>>,
        locals: Vec<Handle<Buffer>>,
    }

    fn kernel(n: usize) -> Kernel {
        let mut func = Function::new("k");
        let mut globals = Vec::new();
        let mut locals = Vec::new();
        for i in 0..n {
            let g = Buffer::fixed(format!("g{i}"), DataType::I32, &[16], AddressSpace::Global);
            globals.push(func.add_buffer_param(g));
            let l = Buffer::fixed(format!("l{i}"), DataType::I32, &[16], AddressSpace::Local);
            locals.push(func.add_scratch(l));
        }
        Kernel {
            func,
            globals,
            locals,
        }
    }

    fn dma(func: &mut Function, src: Handle<Buffer>, dst: Handle<Buffer>) -> Stmt {
        let event = func.events.append(Event {
            name: format!("dma{}", func.events.len()),
        });
        let end = |buffer| DmaEndpoint {
            buffer,
            offset: Expr::i32(0),
        };
        Stmt::Dma(DmaTransfer {
            src: end(src),
            dst: end(dst),
            dims: vec![DmaDim {
                length: Expr::i32(16),
                src_stride: Expr::i32(4),
                dst_stride: Expr::i32(4),
            }],
            elem_bytes: 4,
            event,
        })
    }

    fn read(buffer: Handle<Buffer>) -> Stmt {
        Stmt::Evaluate(Expr::load(buffer, vec![Expr::i32(0)], DataType::I32))
    }

    fn write(buffer: Handle<Buffer>) -> Stmt {
        Stmt::store(buffer, vec![Expr::i32(0)], Expr::i32(1))
    }

    fn kinds(stmt: &Stmt) -> Vec<&'static str> {
        stmt.clone()
            .into_flat()
            .iter()
            .map(|s| match s {
                Stmt::Dma(_) => "dma",
                Stmt::Wait(_) => "wait",
                Stmt::For(_) => "for",
                _ => "op",
            })
            .collect()
    }

    #[test]
    fn waits_precede_first_use() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(2);
        let body = vec![
            dma(&mut func, g[0], l[0]),
            dma(&mut func, g[1], l[1]),
            read(l[0]),
            read(l[1]),
        ];
        func.body = Stmt::seq(body);
        let out = run_pass_on(&InitializeEventState, func, &target("v3")).unwrap();
        assert_eq!(kinds(&out.body), ["dma", "dma", "wait", "op", "wait", "op"]);

        let state = out.event_state.as_ref().unwrap();
        assert_eq!(state.slots[0], EventSlot { queue: 0, slot: 0 });
        assert_eq!(state.slots[1], EventSlot { queue: 0, slot: 1 });
        assert_eq!(state.max_in_flight, 2);
        assert!(check_event_safety(&out).is_ok());
    }

    #[test]
    fn outbound_transfers_use_another_queue() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(1);
        func.body = Stmt::seq(vec![dma(&mut func, g[0], l[0]), dma(&mut func, l[0], g[0])]);
        let out = run_pass_on(&InitializeEventState, func, &target("v3")).unwrap();
        // The store back waits for the load it depends on.
        assert_eq!(kinds(&out.body), ["dma", "wait", "dma", "wait"]);
        let state = out.event_state.unwrap();
        assert_eq!(state.slots[1].queue, 1);
    }

    #[test]
    fn full_queue_waits_on_oldest() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(5);
        let mut body: Vec<Stmt> = (0..5).map(|i| dma(&mut func, g[i], l[i])).collect();
        body.extend(l.iter().map(|&b| read(b)));
        func.body = Stmt::seq(body);
        let out = run_pass_on(&InitializeEventState, func, &target("v1")).unwrap();

        let flat = out.body.clone().into_flat();
        assert_eq!(flat[4], Stmt::Wait(Handle::new(0)));
        let state = out.event_state.unwrap();
        assert_eq!(state.max_in_flight, 4);
        // The freed register is reused.
        assert_eq!(state.slots[4], EventSlot { queue: 0, slot: 0 });
    }

    #[test]
    fn loop_bodies_drain_before_next_iteration() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(2);
        let load = dma(&mut func, g[0], l[0]);
        let i = Var::new("i", DataType::I32);
        func.body = Stmt::seq(vec![
            dma(&mut func, g[1], l[1]),
            Stmt::For(Loop::serial(i, Expr::i32(0), Expr::i32(4), load)),
            read(l[1]),
        ]);
        let out = run_pass_on(&InitializeEventState, func, &target("v2")).unwrap();
        // The outer transfer is drained before a loop that issues its own.
        assert_eq!(kinds(&out.body), ["dma", "wait", "for", "op"]);
        let Stmt::For(l) = &out.body.clone().into_flat()[2] else {
            panic!("expected loop");
        };
        assert_eq!(kinds(&l.body), ["dma", "wait"]);
        assert!(check_event_safety(&out).is_ok());
    }

    #[test]
    fn unrelated_work_overlaps_transfer() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(2);
        func.body = Stmt::seq(vec![dma(&mut func, g[0], l[0]), write(l[1]), read(l[0])]);
        let out = run_pass_on(&InitializeEventState, func, &target("v2")).unwrap();
        assert_eq!(kinds(&out.body), ["dma", "op", "wait", "op"]);
    }

    #[test]
    fn read_before_wait_is_rejected() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(1);
        let d = dma(&mut func, g[0], l[0]);
        func.body = Stmt::seq(vec![d, read(l[0]), Stmt::Wait(Handle::new(0))]);
        let (path, message) = check_event_safety(&func).unwrap_err();
        assert_eq!(path.to_string(), "body/1");
        assert!(message.contains("`l0` accessed before waiting on `dma0`"), "{message}");
    }

    #[test]
    fn wait_on_one_branch_is_not_enough() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(1);
        let n = Var::new("n", DataType::I32);
        let d = dma(&mut func, g[0], l[0]);
        func.body = Stmt::seq(vec![
            d,
            Stmt::if_then(Expr::lt(Expr::var(&n), Expr::i32(2)), Stmt::Wait(Handle::new(0))),
            read(l[0]),
        ]);
        let (_, message) = check_event_safety(&func).unwrap_err();
        assert!(message.contains("before waiting"), "{message}");
    }

    #[test]
    fn missing_final_wait_is_rejected() {
        let Kernel {
            mut func,
            globals: g,
            locals: l,
        } = kernel(1);
        func.body = dma(&mut func, g[0], l[0]);
        let (_, message) = check_event_safety(&func).unwrap_err();
        assert!(message.contains("never waited on"), "{message}");
    }
}

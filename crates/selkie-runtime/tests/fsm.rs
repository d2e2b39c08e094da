//! Per-agent finite-state machine
//!
//! A three-state machine walks itself through its states by sending
//! signals to its own direct mailbox, then deregisters normally. State
//! listeners observe every transition.

use selkie_runtime::{run, Agent, AgentContext, Cooperation, DeregReason, Result, Signal, State};
use std::sync::{Arc, Mutex};

struct StepOne;
impl Signal for StepOne {}
struct StepTwo;
impl Signal for StepTwo {}
struct StepThree;
impl Signal for StepThree {}

type Trace = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct Machine {
    st_one: State,
    st_two: State,
    st_three: State,
    transitions: Trace,
}

impl Agent for Machine {
    fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        self.st_one = ctx.make_state("one")?;
        self.st_two = ctx.make_state("two")?;
        self.st_three = ctx.make_state("three")?;

        let transitions = self.transitions.clone();
        ctx.add_state_listener(move |_ctx: &mut AgentContext<'_>, old: &State, new: &State| {
            transitions.lock().unwrap().push(format!("{}->{}", old, new));
        });

        let mbox = ctx.direct_mbox();
        ctx.subscribe(&mbox).in_state(&self.st_one).signal::<StepOne, _, _>(
            |machine: &mut Self, ctx: &mut AgentContext<'_>| {
                ctx.direct_mbox().deliver_signal::<StepTwo>()?;
                let next = machine.st_two.clone();
                ctx.change_state(&next)
            },
        )?;
        ctx.subscribe(&mbox).in_state(&self.st_two).signal::<StepTwo, _, _>(
            |machine: &mut Self, ctx: &mut AgentContext<'_>| {
                ctx.direct_mbox().deliver_signal::<StepThree>()?;
                let next = machine.st_three.clone();
                ctx.change_state(&next)
            },
        )?;
        ctx.subscribe(&mbox).in_state(&self.st_three).signal::<StepThree, _, _>(
            |_machine: &mut Self, ctx: &mut AgentContext<'_>| {
                ctx.deregister_own_coop(DeregReason::Normal)?;
                ctx.env().stop();
                Ok(())
            },
        )?;
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let first = self.st_one.clone();
        ctx.change_state(&first)?;
        ctx.direct_mbox().deliver_signal::<StepOne>()
    }
}

#[test]
fn machine_walks_all_states_and_deregisters_normally() {
    let transitions: Trace = Arc::new(Mutex::new(Vec::new()));
    let reasons: Arc<Mutex<Vec<(String, DeregReason)>>> = Arc::new(Mutex::new(Vec::new()));

    let machine = Machine {
        transitions: transitions.clone(),
        ..Default::default()
    };

    let observed = reasons.clone();
    run(move |env| {
        let mut coop = Cooperation::new("fsm");
        coop.add_agent(machine);
        coop.add_dereg_notifier(Box::new(move |_env, coop, reason| {
            observed.lock().unwrap().push((coop.to_string(), reason));
            Ok(())
        }));
        env.register_coop(coop)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(
        &*transitions.lock().unwrap(),
        &[
            "<DEFAULT>->one".to_string(),
            "one->two".to_string(),
            "two->three".to_string(),
        ]
    );

    // Repeated deregistration attempts (the explicit one plus shutdown)
    // produce exactly one notification, with the first reason.
    assert_eq!(
        &*reasons.lock().unwrap(),
        &[("fsm".to_string(), DeregReason::Normal)]
    );
}

#[test]
fn foreign_state_is_rejected() {
    struct Intruder {
        stolen: Arc<Mutex<Option<State>>>,
    }

    impl Agent for Intruder {
        fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            // A placeholder state is owned by no agent; switching to it
            // must fail without touching the current state.
            let foreign = State::default();
            let result = ctx.change_state(&foreign);
            assert!(matches!(
                result,
                Err(selkie_runtime::Error::StateNotOwned { .. })
            ));
            *self.stolen.lock().unwrap() = Some(ctx.current_state());
            ctx.env().stop();
            Ok(())
        }
    }

    let stolen = Arc::new(Mutex::new(None));
    let probe = stolen.clone();
    run(move |env| {
        env.register_agent_as_coop("intruder", Intruder { stolen: probe })?;
        Ok(())
    })
    .unwrap();

    let state = stolen.lock().unwrap().take().unwrap();
    assert!(state.is_default());
}

//! Subscription semantics: direct-mailbox uniqueness, unsubscribe
//! round-trip, MPMC fan-out, delivery filters, deregistration idempotence

use selkie_runtime::{
    run, Agent, AgentContext, Cooperation, DeregReason, Error, Mbox, Result, Signal,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Ping(u64);

struct Done;
impl Signal for Done {}

#[test]
fn second_handler_on_direct_mailbox_fails() {
    struct Doubled;

    impl Agent for Doubled {
        fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            let mbox = ctx.direct_mbox();
            ctx.subscribe(&mbox).message(
                |_agent: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| Ok(()),
            )?;
            ctx.subscribe(&mbox).message(
                |_agent: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| Ok(()),
            )?;
            Ok(())
        }
    }

    run(|env| {
        let result = env.register_agent_as_coop("doubled", Doubled);
        assert!(matches!(result, Err(Error::DuplicateHandler { .. })));
        assert_eq!(env.coop_count(), 0);
        env.stop();
        Ok(())
    })
    .unwrap();
}

#[test]
fn subscribe_then_unsubscribe_drops_deliveries() {
    struct Fickle {
        input: Mbox,
        seen: Arc<AtomicUsize>,
    }

    impl Agent for Fickle {
        fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            let input = self.input.clone();
            ctx.subscribe(&input).message(
                |agent: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| {
                    agent.seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )?;
            ctx.unsubscribe_default::<Ping>(&input)?;

            let direct = ctx.direct_mbox();
            ctx.subscribe(&direct).signal::<Done, _, _>(
                |_agent: &mut Self, ctx: &mut AgentContext<'_>| {
                    ctx.env().stop();
                    Ok(())
                },
            )?;
            Ok(())
        }

        fn on_start(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            self.input.deliver(Ping(1))?;
            ctx.direct_mbox().deliver_signal::<Done>()
        }
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let probe = seen.clone();
    run(move |env| {
        let input = env.create_mbox();
        env.register_agent_as_coop(
            "fickle",
            Fickle {
                input,
                seen: probe,
            },
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[test]
fn mpmc_fanout_reaches_every_subscriber_once() {
    struct StopAll;
    impl Signal for StopAll {}

    struct Member {
        input: Mbox,
        seen: Arc<AtomicUsize>,
    }

    impl Agent for Member {
        fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            let input = self.input.clone();
            ctx.subscribe(&input).message(
                |member: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| {
                    member.seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )?;
            ctx.subscribe(&input).signal::<StopAll, _, _>(
                |_member: &mut Self, ctx: &mut AgentContext<'_>| {
                    // Every member asks; only the first attempt matters.
                    ctx.deregister_own_coop(DeregReason::Normal)
                },
            )?;
            Ok(())
        }
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let notifications: Arc<Mutex<Vec<DeregReason>>> = Arc::new(Mutex::new(Vec::new()));

    let seen_probe = seen.clone();
    let notified = notifications.clone();
    run(move |env| {
        let input = env.create_mbox();
        let mut coop = Cooperation::new("pack");
        for _ in 0..3 {
            coop.add_agent(Member {
                input: input.clone(),
                seen: seen_probe.clone(),
            });
        }
        coop.add_dereg_notifier(Box::new(move |env, _coop, reason| {
            notified.lock().unwrap().push(reason);
            env.stop();
            Ok(())
        }));
        env.register_coop(coop)?;

        // All three subscriptions exist once registration returned; the
        // ping fan-out completes before the stop signal goes out.
        input.deliver(Ping(9))?;
        input.deliver_signal::<StopAll>()?;
        Ok(())
    })
    .unwrap();

    // One ping demand per subscriber, drained before the finish demands.
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    // Several deregistration attempts, exactly one notification.
    assert_eq!(&*notifications.lock().unwrap(), &[DeregReason::Normal]);
}

#[test]
fn delivery_filter_screens_messages_per_subscriber() {
    struct EvenOnly {
        input: Mbox,
        accepted: Arc<Mutex<Vec<u64>>>,
    }

    impl Agent for EvenOnly {
        fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
            let input = self.input.clone();
            ctx.subscribe(&input).thread_safe().message(
                |agent: &mut Self, ctx: &mut AgentContext<'_>, msg: &Ping| {
                    let mut accepted = agent.accepted.lock().unwrap();
                    accepted.push(msg.0);
                    if accepted.len() == 2 {
                        ctx.env().stop();
                    }
                    Ok(())
                },
            )?;
            ctx.set_delivery_filter::<Ping, _>(&input, |ping| ping.0 % 2 == 0)?;
            Ok(())
        }
    }

    let accepted: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let probe = accepted.clone();
    run(move |env| {
        let input = env.create_mbox();
        env.register_agent_as_coop(
            "even-only",
            EvenOnly {
                input: input.clone(),
                accepted: probe,
            },
        )?;

        for value in 1..=4 {
            input.deliver(Ping(value))?;
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(&*accepted.lock().unwrap(), &[2, 4]);
}

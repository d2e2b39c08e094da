//! Message limits: drop and redirect reactions
//!
//! Both scenarios run every agent on one private one-thread dispatcher so
//! the producer finishes enqueueing before the consumer dequeues anything,
//! which makes the limit outcome exact.

use selkie_runtime::{
    run, Agent, AgentContext, AgentOptions, Cooperation, Mbox, MessageLimit, OneThreadDispatcher,
    Result, Signal,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Ping(#[allow(dead_code)] u64);

struct Done;
impl Signal for Done {}

struct Consumer {
    input: Mbox,
    seen: Arc<AtomicUsize>,
}

impl Agent for Consumer {
    fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let input = self.input.clone();
        ctx.subscribe(&input).message(
            |consumer: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| {
                consumer.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )?;
        ctx.subscribe(&input).signal::<Done, _, _>(
            |_consumer: &mut Self, ctx: &mut AgentContext<'_>| {
                ctx.env().stop();
                Ok(())
            },
        )?;
        Ok(())
    }
}

struct Producer {
    target: Mbox,
    count: usize,
}

impl Agent for Producer {
    fn on_start(&mut self, _ctx: &mut AgentContext<'_>) -> Result<()> {
        for value in 0..self.count {
            self.target.deliver(Ping(value as u64))?;
        }
        self.target.deliver_signal::<Done>()
    }
}

#[test]
fn drop_limit_delivers_exactly_once() {
    let seen = Arc::new(AtomicUsize::new(0));

    let observed = seen.clone();
    run(move |env| {
        let input = env.create_mbox();
        let dispatcher = OneThreadDispatcher::spawn(env)?;

        let mut coop = Cooperation::new("limited");
        coop.set_default_binder(dispatcher.binder());
        coop.add_agent_with(
            Consumer {
                input: input.clone(),
                seen: observed.clone(),
            },
            AgentOptions::new().limit(MessageLimit::drop_after::<Ping>(1)),
        );
        coop.add_agent(Producer {
            target: input,
            count: 5,
        });
        env.register_coop(coop)?;
        Ok(())
    })
    .unwrap();

    // Five deliveries against `drop @ 1`: the handler runs exactly once.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

struct Overflow {
    seen: Arc<AtomicUsize>,
}

impl Agent for Overflow {
    fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let mbox = ctx.direct_mbox();
        ctx.subscribe(&mbox).message(
            |agent: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| {
                agent.seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    }
}

#[test]
fn redirect_limit_sends_overflow_elsewhere() {
    let direct = Arc::new(AtomicUsize::new(0));
    let redirected = Arc::new(AtomicUsize::new(0));

    let direct_probe = direct.clone();
    let redirected_probe = redirected.clone();
    run(move |env| {
        let input = env.create_mbox();
        let overflow_box = env.create_mbox();
        let dispatcher = OneThreadDispatcher::spawn(env)?;

        let overflow_target = overflow_box.clone();
        let mut coop = Cooperation::new("redirecting");
        coop.set_default_binder(dispatcher.binder());
        coop.add_agent_with(
            Consumer {
                input: input.clone(),
                seen: direct_probe.clone(),
            },
            AgentOptions::new().limit(MessageLimit::redirect_after::<Ping, _>(1, move || {
                overflow_target.clone()
            })),
        );

        // Overflow sink listens on its own MPMC mailbox.
        struct Sink {
            input: Mbox,
            seen: Arc<AtomicUsize>,
        }
        impl Agent for Sink {
            fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
                let input = self.input.clone();
                ctx.subscribe(&input).message(
                    |sink: &mut Self, _ctx: &mut AgentContext<'_>, _msg: &Ping| {
                        sink.seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
            }
        }
        coop.add_agent(Sink {
            input: overflow_box,
            seen: redirected_probe.clone(),
        });
        coop.add_agent(Producer {
            target: input,
            count: 3,
        });
        env.register_coop(coop)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(direct.load(Ordering::SeqCst), 1);
    assert_eq!(redirected.load(Ordering::SeqCst), 2);
}

//! Service requests: one-shot futures over mailboxes

use selkie_runtime::{run, Agent, AgentContext, Error, Mbox, Result};
use std::time::Duration;

struct Query(u64);
struct Answer(u64);

struct Responder {
    input: Mbox,
}

impl Agent for Responder {
    fn define(&mut self, ctx: &mut AgentContext<'_>) -> Result<()> {
        let input = self.input.clone();
        ctx.subscribe(&input).request(
            |_responder: &mut Self, _ctx: &mut AgentContext<'_>, query: &Query| {
                if query.0 == 0 {
                    return Err(Error::internal("zero is not a question"));
                }
                Ok(Answer(query.0 * 2))
            },
        )
    }
}

#[test]
fn request_without_subscriber_resolves_no_handler_immediately() {
    run(|env| {
        let mbox = env.create_mbox();
        let future = mbox.request::<Query, Answer>(Query(1));
        // Resolved before `request` returned; the recv cannot block.
        assert!(matches!(future.recv(), Err(Error::NoHandler { .. })));
        env.stop();
        Ok(())
    })
    .unwrap();
}

#[test]
fn request_round_trip_returns_handler_result() {
    run(|env| {
        let mbox = env.create_mbox();
        env.introduce_coop(|coop| {
            coop.add_agent(Responder {
                input: mbox.clone(),
            });
            Ok(())
        })?;

        let answer = mbox
            .request::<Query, Answer>(Query(21))
            .recv_timeout(Duration::from_secs(4))?;
        assert_eq!(answer.0, 42);

        // A failing handler resolves the future with its error instead of
        // entering the exception-reaction chain.
        let failure = mbox
            .request::<Query, Answer>(Query(0))
            .recv_timeout(Duration::from_secs(4));
        assert!(matches!(failure, Err(Error::Internal { .. })));

        env.stop();
        Ok(())
    })
    .unwrap();
}

#[test]
fn request_with_wrong_result_type_is_rejected() {
    run(|env| {
        let mbox = env.create_mbox();
        env.introduce_coop(|coop| {
            coop.add_agent(Responder {
                input: mbox.clone(),
            });
            Ok(())
        })?;

        // The handler produces `Answer`, not `String`.
        let failure = mbox
            .request::<Query, String>(Query(3))
            .recv_timeout(Duration::from_secs(4));
        assert!(matches!(failure, Err(Error::HandlerFailed { .. })));

        env.stop();
        Ok(())
    })
    .unwrap();
}

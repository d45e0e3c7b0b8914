use std::time::Duration;

use proptest::prelude::*;

use botlink_protocol::{Body, CorrelationId, Envelope, PeerId, PendingCalls, ProtocolError};

#[derive(Debug, Clone, Copy)]
enum Fulfillment {
    Resolve,
    Reject,
    Cancel,
    Expire,
}

fn arb_fulfillment() -> impl Strategy<Value = Fulfillment> {
    prop_oneof![
        Just(Fulfillment::Resolve),
        Just(Fulfillment::Reject),
        Just(Fulfillment::Cancel),
        Just(Fulfillment::Expire),
    ]
}

fn reply_for(id: &CorrelationId) -> Envelope {
    let mut envelope = Envelope::call(
        PeerId::new("hub"),
        PeerId::new("bot-1"),
        "echo",
        Body::empty(),
    );
    envelope.promise_id = Some(id.clone());
    envelope
}

proptest! {
    /// Each registered call is fulfilled at most once, whatever pair of
    /// resolution, rejection, cancellation and expiry races for it —
    /// and the waiter observes exactly the winning outcome.
    #[test]
    fn at_most_once_fulfillment(
        ops in prop::collection::vec((arb_fulfillment(), arb_fulfillment()), 1..40)
    ) {
        let calls = PendingCalls::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        for (i, (first, second)) in ops.iter().enumerate() {
            let id = CorrelationId::from(format!("q{i}").as_str());
            let timeout = match first {
                Fulfillment::Expire => Duration::ZERO,
                _ => Duration::from_secs(600),
            };
            let pending = calls
                .register(id.clone(), PeerId::new("hub"), timeout)
                .unwrap();

            let apply = |op: Fulfillment| match op {
                Fulfillment::Resolve => calls.resolve(&id, reply_for(&id)),
                Fulfillment::Reject => calls.reject(&id, ProtocolError::Remote("boom".into())),
                Fulfillment::Cancel => calls.cancel(&id),
                Fulfillment::Expire => calls.expire() > 0,
            };

            prop_assert!(apply(*first), "the first fulfillment wins");
            prop_assert!(!apply(*second), "anything after it is a no-op");
            prop_assert!(calls.is_empty(), "the slot is vacated");

            let outcome = rt.block_on(pending.wait());
            match first {
                Fulfillment::Resolve => prop_assert!(outcome.is_ok()),
                Fulfillment::Reject => {
                    prop_assert!(matches!(outcome, Err(ProtocolError::Remote(_))))
                }
                Fulfillment::Cancel => {
                    prop_assert!(matches!(outcome, Err(ProtocolError::Cancelled(_))))
                }
                Fulfillment::Expire => {
                    prop_assert!(matches!(outcome, Err(ProtocolError::Timeout(_))))
                }
            }
        }
    }

    /// Correlation ids stay unique for the lifetime of the pending call:
    /// re-registering a fulfilled id is allowed, re-registering a live
    /// one never is.
    #[test]
    fn duplicate_ids_rejected_only_while_pending(raw_id in "[a-z0-9]{1,16}") {
        let calls = PendingCalls::new();
        let id = CorrelationId::from(raw_id.as_str());

        let _live = calls
            .register(id.clone(), PeerId::new("hub"), Duration::from_secs(600))
            .unwrap();
        let err = calls
            .register(id.clone(), PeerId::new("hub"), Duration::from_secs(600))
            .unwrap_err();
        prop_assert!(matches!(err, ProtocolError::DuplicateCorrelationId(_)));

        calls.cancel(&id);
        prop_assert!(calls
            .register(id, PeerId::new("hub"), Duration::from_secs(600))
            .is_ok());
    }
}

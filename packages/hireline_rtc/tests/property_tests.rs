use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use hireline_rtc::messages::{MessagePage, MessageStream};
use hireline_rtc::{Message, MessageId, MessageStatus, TempId};

fn at(second: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::seconds(second)
}

fn stream() -> MessageStream {
    let mut stream = MessageStream::new("c1".into(), "me".into(), Some("u2".into()));
    stream.apply_latest(MessagePage::default());
    stream
}

fn confirmed(index: usize, temp_id: Option<TempId>, sender: &str) -> Message {
    Message {
        id: Some(MessageId::new(format!("m{index}"))),
        temp_id,
        conversation_id: "c1".into(),
        sender_id: sender.into(),
        recipient_id: if sender == "me" { "u2".into() } else { "me".into() },
        content: format!("msg {index}"),
        sent_at: at(index as i64),
        is_read: false,
        read_at: None,
        status: MessageStatus::Sent,
        failure: None,
    }
}

// --- tempId reconciliation under arbitrary echo/ack orderings ---

#[derive(Debug, Clone, Copy)]
enum Delivery {
    Ack,
    /// Real-time echo; `true` when the server included our temp id.
    Echo(bool),
}

fn arb_deliveries() -> impl Strategy<Value = (usize, Vec<(usize, Delivery)>)> {
    (1usize..8)
        .prop_flat_map(|n| {
            (
                Just(n),
                proptest::collection::vec(proptest::option::of(any::<bool>()), n),
            )
        })
        .prop_flat_map(|(n, echoes)| {
            let mut events = Vec::new();
            for (i, echo) in echoes.into_iter().enumerate() {
                events.push((i, Delivery::Ack));
                if let Some(with_temp) = echo {
                    events.push((i, Delivery::Echo(with_temp)));
                }
            }
            (Just(n), Just(events).prop_shuffle())
        })
}

proptest! {
    #[test]
    fn every_temp_id_reconciles_to_exactly_one_entry((n, deliveries) in arb_deliveries()) {
        let mut stream = stream();
        let temps: Vec<TempId> = (0..n)
            .map(|i| stream.compose(format!("msg {i}"), at(i as i64)))
            .collect();
        for temp_id in &temps {
            stream.dispatch(*temp_id).unwrap();
        }

        for (i, delivery) in deliveries {
            match delivery {
                Delivery::Ack => stream.on_ack(temps[i], confirmed(i, None, "me")),
                Delivery::Echo(with_temp) => {
                    let temp_id = with_temp.then_some(temps[i]);
                    stream.on_incoming(confirmed(i, temp_id, "me"));
                }
            }
        }

        prop_assert_eq!(stream.len(), n);
        let messages = stream.messages();
        let ids: HashSet<_> = messages.iter().filter_map(|m| m.id.clone()).collect();
        prop_assert_eq!(ids.len(), n);
        prop_assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
        for (i, temp_id) in temps.iter().enumerate() {
            let entry = stream.find_by_temp(temp_id);
            prop_assert_eq!(
                entry.and_then(|m| m.id.clone()),
                Some(MessageId::new(format!("m{i}")))
            );
        }
    }

    #[test]
    fn temp_ids_are_unique(count in 1usize..64) {
        let mut stream = stream();
        let temps: HashSet<TempId> = (0..count)
            .map(|i| stream.compose(format!("msg {i}"), at(i as i64)))
            .collect();
        prop_assert_eq!(temps.len(), count);
    }
}

// --- resync merges ---

proptest! {
    #[test]
    fn resync_is_idempotent(
        total in 1usize..30,
        seen in 0usize..30,
        repeats in 1usize..4,
    ) {
        let seen = seen.min(total);
        let history: Vec<Message> = (0..total).map(|i| confirmed(i, None, "u2")).collect();

        let mut stream = stream();
        for message in history.iter().take(seen) {
            stream.on_incoming(message.clone());
        }

        let first = stream.apply_resync(history.clone());
        prop_assert_eq!(first, total - seen);
        for _ in 0..repeats {
            prop_assert_eq!(stream.apply_resync(history.clone()), 0);
        }

        let messages = stream.messages();
        prop_assert_eq!(messages.len(), total);
        prop_assert!(messages.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
    }

    #[test]
    fn resync_in_any_order_yields_chronological_history(
        order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut stream = stream();
        let shuffled: Vec<Message> = order.iter().map(|&i| confirmed(i, None, "u2")).collect();
        stream.apply_resync(shuffled);

        let ids: Vec<String> = stream
            .messages()
            .iter()
            .filter_map(|m| m.id.as_ref().map(|id| id.to_string()))
            .collect();
        let expected: Vec<String> = (0..12).map(|i| format!("m{i}")).collect();
        prop_assert_eq!(ids, expected);
    }
}

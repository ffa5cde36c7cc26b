use proptest::prelude::*;
use server::live_stream::{StreamBuffer, StreamEvent};
use server::model::{EntityAddress, MessageRecord};
use std::time::Duration;

fn event(sequence_number: i64) -> StreamEvent {
    let message = MessageRecord {
        sequence_number,
        body: format!("event {sequence_number}").into_bytes(),
        ..Default::default()
    };
    StreamEvent::new(message, &EntityAddress::entity("orders"))
}

proptest! {
    #[test]
    fn visible_window_keeps_the_newest_events(pushed in 0i64..1_200) {
        let buffer = StreamBuffer::new(500, Duration::from_millis(100));
        for sequence in 1..=pushed {
            buffer.push(event(sequence));
        }
        buffer.flush();

        let visible = buffer.snapshot();
        prop_assert_eq!(visible.len() as i64, pushed.min(500));
        if let Some(first) = visible.first() {
            prop_assert_eq!(first.sequence_number(), (pushed - 499).max(1));
            prop_assert_eq!(visible.last().unwrap().sequence_number(), pushed);
        }
        prop_assert!(visible.windows(2).all(|w| w[0].sequence_number() < w[1].sequence_number()));
    }

    #[test]
    fn filtered_view_is_a_subset_of_the_window(
        bodies in prop::collection::vec("[a-c]{1,4}", 0..50),
        filter in "[a-c]{0,2}",
    ) {
        let buffer = StreamBuffer::new(20, Duration::from_millis(100));
        for (i, body) in bodies.iter().enumerate() {
            let message = MessageRecord {
                sequence_number: i as i64 + 1,
                body: body.clone().into_bytes(),
                ..Default::default()
            };
            buffer.push(StreamEvent::new(message, &EntityAddress::entity("orders")));
        }
        buffer.set_filter(filter.clone());

        let window = buffer.snapshot();
        let filtered = buffer.filtered();
        prop_assert!(filtered.len() <= window.len());
        prop_assert!(filtered.iter().all(|e| e.matches(&filter)));
        prop_assert!(filtered.iter().all(|e| window.contains(e)));
    }
}

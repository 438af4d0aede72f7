/*! Reaction engine.

A pure mapping from one inbound event to the outbound command frames the
configuration asks for. Switch presses look up the pressed slot (1-based)
in the sender's `SWITCH` table; climate reports fan out the `DHT` list with
`{temperature}`/`{humidity}` substituted. Everything else reacts to nothing.

The caller routes the returned frames onto the right port queues.
*/
use log::{error, info};

use crate::message::{Event, EventBody, prepare_commands};
use crate::packet::Frame;
use crate::registry::Registry;

/// Derive the configured reactions for one event.
pub fn execute(event: &Event, registry: &Registry) -> Vec<Frame> {
    let Some(node) = registry.by_id(event.source) else {
        error!("[UNKNOWN]->HUB {event}");
        return Vec::new();
    };
    let mut out = Vec::new();
    match &event.body {
        EventBody::Switch(state) => {
            if node.switch.is_empty() {
                info!("[UNCONFIGURED]->HUB {event}");
                return out;
            }
            for (slot, pressed) in (1u8..).zip(state.iter()) {
                if *pressed != 1 {
                    continue;
                }
                let Some(commands) = node.switch.get(&slot) else {
                    continue;
                };
                for command in commands {
                    match registry.by_name(&command.target) {
                        Some(target) => {
                            out.extend(prepare_commands(&target, &command.spec, &[]))
                        }
                        None => error!(
                            "EXECUTE: reaction target {:?} of {} is not configured",
                            command.target, node.name
                        ),
                    }
                }
            }
        }
        EventBody::Dht { .. } => {
            if node.dht.is_empty() {
                info!("[UNCONFIGURED]->HUB {event}");
                return out;
            }
            let values = event.format_values();
            for command in &node.dht {
                match registry.by_name(&command.target) {
                    Some(target) => {
                        out.extend(prepare_commands(&target, &command.spec, &values))
                    }
                    None => error!(
                        "EXECUTE: reaction target {:?} of {} is not configured",
                        command.target, node.name
                    ),
                }
            }
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::message::parse;
    use crate::registry::Registry;

    fn registry() -> Registry {
        let config = Config::parse(
            r#"
sim:
  ARDUINO_TEST:
    net: 36097
    config: { LIGHT: 1, SWITCH: 1 }
    SWITCH:
      1: [{ ARDUINO_TEST: { LIGHT: [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0] } }]
      2: [{ ARDUINO_TEST: { LIGHT: [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0] } }]
    DHT:
      - { ARDUINO_TEST: { LCDPRINT: [0, 0, 0, "Temp:{temperature}"] } }
      - { ARDUINO_TEST: { LCDPRINT: [0, 1, 0, "Hum:{humidity}"] } }
"#,
        )
        .unwrap();
        Registry::new(&config).unwrap()
    }

    fn event(data: &[u8]) -> Event {
        parse(
            &Frame {
                source: 36097,
                dest: 1,
                data: data.to_vec(),
            },
            &registry(),
        )
        .unwrap()
    }

    #[test]
    fn switch_triggers_light() {
        let r = registry();
        let ev = event(&[0xa3, 1, 0, 0, 0, 0, 0]);
        let frames = execute(&ev, &r);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dest, 36097);
        assert_eq!(frames[0].data, vec![0xa4, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn switch_slot_two() {
        let r = registry();
        let frames = execute(&event(&[0xa3, 0, 1, 0, 0, 0, 0]), &r);
        assert_eq!(frames[0].data, vec![0xa4, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn switch_reactions_are_deterministic() {
        let r = registry();
        let ev = event(&[0xa3, 1, 0, 0, 0, 0, 0]);
        assert_eq!(execute(&ev, &r), execute(&ev, &r));
    }

    #[test]
    fn dht_templated_fanout() {
        let r = registry();
        let mut d = vec![0xa0];
        d.extend_from_slice(&0i16.to_le_bytes());
        d.extend_from_slice(&0i16.to_le_bytes());
        let frames = execute(&event(&d), &r);
        assert_eq!(frames.len(), 2);
        let mut first = vec![0x92, 0, 0, 0];
        first.extend_from_slice(b"Temp:0.0");
        let mut second = vec![0x92, 0, 1, 0];
        second.extend_from_slice(b"Hum:0.0");
        assert_eq!(frames[0].data, first);
        assert_eq!(frames[1].data, second);
    }

    #[test]
    fn unknown_source_reacts_to_nothing() {
        let r = registry();
        let ev = parse(
            &Frame {
                source: 99,
                dest: 1,
                data: vec![0xa3, 1, 0, 0, 0, 0, 0],
            },
            &r,
        )
        .unwrap();
        assert!(execute(&ev, &r).is_empty());
    }

    #[test]
    fn unconfigured_event_reacts_to_nothing() {
        let r = registry();
        // Heartbeats carry no reactions.
        let ev = event(&[0x9f]);
        assert!(execute(&ev, &r).is_empty());
    }

    #[test]
    fn unpressed_slots_ignored() {
        let r = registry();
        // Slot values other than 1 do not fire.
        let frames = execute(&event(&[0xa3, 2, 0, 0, 0, 0, 0]), &r);
        assert!(frames.is_empty());
    }
}

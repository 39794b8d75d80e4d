mod client_descriptor;
mod connection_id;
mod entity_tuple;
mod message_key;
mod process_id;

pub use client_descriptor::ClientDescriptor;
pub use connection_id::ConnectionId;
pub use entity_tuple::EntityTuple;
pub use message_key::MessageKey;
pub use process_id::ProcessId;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn msgpack() {
                    let val = $val;
                    let bytes = rmp_serde::to_vec(&val).unwrap();
                    let decoded = rmp_serde::from_slice(&bytes).unwrap();
                    assert_eq!(val, decoded);
                }

                #[test]
                fn json() {
                    let val = $val;
                    let json = serde_json::to_string(&val).unwrap();
                    let decoded = serde_json::from_str(&json).unwrap();
                    assert_eq!(val, decoded);
                }
            }
        };
    }

    serde_round_trip!(entity_tuple, EntityTuple::new("counter", "alpha"));
    serde_round_trip!(connection_id, ConnectionId(7));
    serde_round_trip!(process_id, ProcessId(3));
    serde_round_trip!(message_key, MessageKey(11));
    serde_round_trip!(
        client_descriptor,
        ClientDescriptor::new(ConnectionId(2), 5)
    );

    #[test]
    fn client_descriptor_equality_needs_both_parts() {
        use std::collections::HashSet;
        let a = ClientDescriptor::new(ConnectionId(1), 1);
        let b = ClientDescriptor::new(ConnectionId(1), 1);
        let c = ClientDescriptor::new(ConnectionId(1), 2);
        let d = ClientDescriptor::new(ConnectionId(2), 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
        set.insert(c);
        set.insert(d);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn entity_tuple_display() {
        assert_eq!(EntityTuple::new("map", "users").to_string(), "map:users");
    }
}

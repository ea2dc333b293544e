//! Protobuf encoding for the mutex service messages.
//!
//! Hand-written `prost::Message` implementations matching:
//!
//! ```text
//! package mutex;
//!
//! service MutexService {
//!   rpc RequestAccess (AccessRequest) returns (AccessResponse);
//!   rpc ReleaseAccess (ReleaseRequest) returns (ReleaseResponse);
//! }
//!
//! message AccessRequest   { string node_id = 1; uint64 lamport_timestamp = 2; }
//! message AccessResponse  { bool granted = 1;   uint64 lamport_timestamp = 2; }
//! message ReleaseRequest  { string node_id = 1; uint64 lamport_timestamp = 2; }
//! message ReleaseResponse { bool acknowledged = 1; uint64 lamport_timestamp = 2; }
//! ```

use crate::engine::{LogicalTimestamp, NodeId, PeerReply, Request};
use prost::{DecodeError, Message};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "mutex.MutexService";

/// Path of the `RequestAccess` method.
pub const REQUEST_ACCESS_PATH: &str = "/mutex.MutexService/RequestAccess";

/// Path of the `ReleaseAccess` method.
pub const RELEASE_ACCESS_PATH: &str = "/mutex.MutexService/ReleaseAccess";

/// `{ string node_id = 1; uint64 lamport_timestamp = 2; }`
macro_rules! node_stamped_message {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, Debug, PartialEq, Eq)]
        pub struct $name {
            pub node_id: String,        // field 1
            pub lamport_timestamp: u64, // field 2
        }

        impl Message for $name {
            fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
            where
                Self: Sized,
            {
                if !self.node_id.is_empty() {
                    prost::encoding::string::encode(1, &self.node_id, buf);
                }
                if self.lamport_timestamp != 0 {
                    prost::encoding::uint64::encode(2, &self.lamport_timestamp, buf);
                }
            }

            fn merge_field(
                &mut self,
                tag: u32,
                wire_type: prost::encoding::WireType,
                buf: &mut impl prost::bytes::Buf,
                ctx: prost::encoding::DecodeContext,
            ) -> Result<(), DecodeError>
            where
                Self: Sized,
            {
                match tag {
                    1 => prost::encoding::string::merge(wire_type, &mut self.node_id, buf, ctx),
                    2 => prost::encoding::uint64::merge(
                        wire_type,
                        &mut self.lamport_timestamp,
                        buf,
                        ctx,
                    ),
                    _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
                }
            }

            fn encoded_len(&self) -> usize {
                let mut len = 0;
                if !self.node_id.is_empty() {
                    len += prost::encoding::string::encoded_len(1, &self.node_id);
                }
                if self.lamport_timestamp != 0 {
                    len += prost::encoding::uint64::encoded_len(2, &self.lamport_timestamp);
                }
                len
            }

            fn clear(&mut self) {
                *self = Self::default();
            }
        }

        impl From<Request> for $name {
            fn from(request: Request) -> Self {
                Self {
                    node_id: request.requester().to_string(),
                    lamport_timestamp: request.timestamp().get(),
                }
            }
        }

        impl $name {
            /// Convert to an engine request, rejecting an empty node id.
            pub fn into_request(self) -> Result<Request, String> {
                if self.node_id.is_empty() {
                    return Err(concat!(stringify!($name), " without node_id").to_string());
                }
                Ok(Request::new(
                    NodeId::new(self.node_id),
                    LogicalTimestamp::new(self.lamport_timestamp),
                ))
            }
        }
    };
}

/// `{ bool <flag> = 1; uint64 lamport_timestamp = 2; }`
macro_rules! flagged_reply_message {
    ($(#[$meta:meta])* $name:ident, $flag:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, Debug, PartialEq, Eq)]
        pub struct $name {
            pub $flag: bool,            // field 1
            pub lamport_timestamp: u64, // field 2
        }

        impl Message for $name {
            fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
            where
                Self: Sized,
            {
                if self.$flag {
                    prost::encoding::bool::encode(1, &self.$flag, buf);
                }
                if self.lamport_timestamp != 0 {
                    prost::encoding::uint64::encode(2, &self.lamport_timestamp, buf);
                }
            }

            fn merge_field(
                &mut self,
                tag: u32,
                wire_type: prost::encoding::WireType,
                buf: &mut impl prost::bytes::Buf,
                ctx: prost::encoding::DecodeContext,
            ) -> Result<(), DecodeError>
            where
                Self: Sized,
            {
                match tag {
                    1 => prost::encoding::bool::merge(wire_type, &mut self.$flag, buf, ctx),
                    2 => prost::encoding::uint64::merge(
                        wire_type,
                        &mut self.lamport_timestamp,
                        buf,
                        ctx,
                    ),
                    _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
                }
            }

            fn encoded_len(&self) -> usize {
                let mut len = 0;
                if self.$flag {
                    len += prost::encoding::bool::encoded_len(1, &self.$flag);
                }
                if self.lamport_timestamp != 0 {
                    len += prost::encoding::uint64::encoded_len(2, &self.lamport_timestamp);
                }
                len
            }

            fn clear(&mut self) {
                *self = Self::default();
            }
        }

        impl From<PeerReply> for $name {
            fn from(reply: PeerReply) -> Self {
                Self {
                    $flag: reply.granted,
                    lamport_timestamp: reply.timestamp.get(),
                }
            }
        }

        impl From<$name> for PeerReply {
            fn from(message: $name) -> Self {
                Self {
                    granted: message.$flag,
                    timestamp: LogicalTimestamp::new(message.lamport_timestamp),
                }
            }
        }
    };
}

node_stamped_message!(
    /// Wire-format `AccessRequest`: a peer asking for the critical section.
    AccessRequest
);

node_stamped_message!(
    /// Wire-format `ReleaseRequest`: a peer delivering a deferred grant.
    ReleaseRequest
);

flagged_reply_message!(
    /// Wire-format `AccessResponse`. `granted = false` means a release follows.
    AccessResponse,
    granted
);

flagged_reply_message!(
    /// Wire-format `ReleaseResponse`.
    ReleaseResponse,
    acknowledged
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_request_wire_bytes() {
        let msg = AccessRequest {
            node_id: "n1".to_string(),
            lamport_timestamp: 5,
        };
        // field 1, length-delimited "n1"; field 2, varint 5
        assert_eq!(msg.encode_to_vec(), vec![0x0a, 0x02, b'n', b'1', 0x10, 0x05]);
        assert_eq!(msg.encoded_len(), 6);
    }

    #[test]
    fn test_default_fields_are_omitted() {
        assert!(AccessResponse::default().encode_to_vec().is_empty());
        let denied = AccessResponse {
            granted: false,
            lamport_timestamp: 1,
        };
        assert_eq!(denied.encode_to_vec(), vec![0x10, 0x01]);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // field 1 = "n2", field 3 = varint 9 (unknown), field 2 = 7
        let bytes = [0x0a, 0x02, b'n', b'2', 0x18, 0x09, 0x10, 0x07];
        let decoded = ReleaseRequest::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.node_id, "n2");
        assert_eq!(decoded.lamport_timestamp, 7);
    }

    #[test]
    fn test_request_conversion() {
        let request = Request::new(NodeId::new("node2"), LogicalTimestamp::new(12));
        let wire = AccessRequest::from(request.clone());
        assert_eq!(wire.into_request().unwrap(), request);

        assert!(AccessRequest::default().into_request().is_err());
    }

    #[test]
    fn test_reply_conversion() {
        let reply = PeerReply::defer(LogicalTimestamp::new(3));
        let wire = ReleaseResponse::from(reply);
        assert!(!wire.acknowledged);
        assert_eq!(PeerReply::from(wire), reply);
    }
}

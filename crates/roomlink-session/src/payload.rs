//! Application payloads carried inside relayed data messages.
//!
//! Every payload starts with a one-byte tag. Fields are little-endian and
//! object ids are 7-bit length-prefixed strings.
//!
//! ```text
//! 0 ObjectSync               id, u8 (slot << 1 | rpc), i32 len, bytes
//! 1 TakeOwnership            id
//! 2 Instantiate              id, kind
//! 3 InstantiateWithTransform id, kind, 3 x f32 position, 4 x f32 rotation
//! 4 InstantiateWithState     id, kind, i32 len, state
//! 5 Destroy                  id
//! 6 DeleteSceneObjects       i32 n, n x id
//! 7 ForceState               id, i32 len, state
//! 8 KeepAlive
//! 9 Custom                   i32 len, bytes
//! ```

use roomlink_net::{Reader, Transform, WireError, Writer};

/// Highest component slot addressable by the packed slot byte.
pub const MAX_SLOT: u8 = 0x7f;

/// Errors decoding an application payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The leading tag is not a known payload type.
    #[error("unknown payload tag {0}")]
    UnknownTag(u8),

    /// A field could not be read.
    #[error("malformed payload: {0}")]
    Wire(#[from] WireError),
}

/// Decoded application payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// Bytes for one component of one object.
    ObjectSync {
        network_id: String,
        slot: u8,
        is_rpc: bool,
        data: Vec<u8>,
    },
    /// The sender now owns the object.
    TakeOwnership { network_id: String },
    /// Spawn a prefab.
    Instantiate { network_id: String, kind: String },
    /// Spawn a prefab at a pose.
    InstantiateWithTransform {
        network_id: String,
        kind: String,
        transform: Transform,
    },
    /// Spawn a prefab with packed initial state.
    InstantiateWithState {
        network_id: String,
        kind: String,
        state: Vec<u8>,
    },
    /// Remove an object.
    Destroy { network_id: String },
    /// Scene objects already destroyed in this room.
    DeleteSceneObjects { network_ids: Vec<String> },
    /// Overwrite every component's state with the owner's.
    ForceState { network_id: String, state: Vec<u8> },
    /// Keeps idle connections from timing out; carries nothing.
    KeepAlive,
    /// Host-defined bytes.
    Custom { payload: Vec<u8> },
}

impl AppMessage {
    pub const OBJECT_SYNC: u8 = 0;
    pub const TAKE_OWNERSHIP: u8 = 1;
    pub const INSTANTIATE: u8 = 2;
    pub const INSTANTIATE_WITH_TRANSFORM: u8 = 3;
    pub const INSTANTIATE_WITH_STATE: u8 = 4;
    pub const DESTROY: u8 = 5;
    pub const DELETE_SCENE_OBJECTS: u8 = 6;
    pub const FORCE_STATE: u8 = 7;
    pub const KEEP_ALIVE: u8 = 8;
    pub const CUSTOM: u8 = 9;

    /// Append this payload to `w`.
    pub fn encode(&self, w: &mut Writer) {
        match self {
            AppMessage::ObjectSync {
                network_id,
                slot,
                is_rpc,
                data,
            } => {
                write_sync_header(w, network_id, *slot, *is_rpc);
                write_blob(w, data);
            }
            AppMessage::TakeOwnership { network_id } => {
                w.write_u8(Self::TAKE_OWNERSHIP);
                w.write_string(network_id);
            }
            AppMessage::Instantiate { network_id, kind } => {
                w.write_u8(Self::INSTANTIATE);
                w.write_string(network_id);
                w.write_string(kind);
            }
            AppMessage::InstantiateWithTransform {
                network_id,
                kind,
                transform,
            } => {
                w.write_u8(Self::INSTANTIATE_WITH_TRANSFORM);
                w.write_string(network_id);
                w.write_string(kind);
                w.write_transform(transform);
            }
            AppMessage::InstantiateWithState {
                network_id,
                kind,
                state,
            } => {
                w.write_u8(Self::INSTANTIATE_WITH_STATE);
                w.write_string(network_id);
                w.write_string(kind);
                write_blob(w, state);
            }
            AppMessage::Destroy { network_id } => {
                w.write_u8(Self::DESTROY);
                w.write_string(network_id);
            }
            AppMessage::DeleteSceneObjects { network_ids } => {
                w.write_u8(Self::DELETE_SCENE_OBJECTS);
                w.write_i32(network_ids.len() as i32);
                for id in network_ids {
                    w.write_string(id);
                }
            }
            AppMessage::ForceState { network_id, state } => {
                w.write_u8(Self::FORCE_STATE);
                w.write_string(network_id);
                write_blob(w, state);
            }
            AppMessage::KeepAlive => w.write_u8(Self::KEEP_ALIVE),
            AppMessage::Custom { payload } => {
                w.write_u8(Self::CUSTOM);
                write_blob(w, payload);
            }
        }
    }

    /// Decode a complete payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader::new(bytes);
        let msg = match r.read_u8()? {
            Self::OBJECT_SYNC => {
                let network_id = r.read_string()?;
                let packed = r.read_u8()?;
                AppMessage::ObjectSync {
                    network_id,
                    slot: packed >> 1,
                    is_rpc: packed & 1 == 1,
                    data: read_blob(&mut r)?,
                }
            }
            Self::TAKE_OWNERSHIP => AppMessage::TakeOwnership {
                network_id: r.read_string()?,
            },
            Self::INSTANTIATE => AppMessage::Instantiate {
                network_id: r.read_string()?,
                kind: r.read_string()?,
            },
            Self::INSTANTIATE_WITH_TRANSFORM => AppMessage::InstantiateWithTransform {
                network_id: r.read_string()?,
                kind: r.read_string()?,
                transform: r.read_transform()?,
            },
            Self::INSTANTIATE_WITH_STATE => AppMessage::InstantiateWithState {
                network_id: r.read_string()?,
                kind: r.read_string()?,
                state: read_blob(&mut r)?,
            },
            Self::DESTROY => AppMessage::Destroy {
                network_id: r.read_string()?,
            },
            Self::DELETE_SCENE_OBJECTS => {
                let n = r.read_len()?;
                let mut network_ids = Vec::new();
                for _ in 0..n {
                    network_ids.push(r.read_string()?);
                }
                AppMessage::DeleteSceneObjects { network_ids }
            }
            Self::FORCE_STATE => AppMessage::ForceState {
                network_id: r.read_string()?,
                state: read_blob(&mut r)?,
            },
            Self::KEEP_ALIVE => AppMessage::KeepAlive,
            Self::CUSTOM => AppMessage::Custom {
                payload: read_blob(&mut r)?,
            },
            other => return Err(PayloadError::UnknownTag(other)),
        };
        Ok(msg)
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AppMessage::ObjectSync { .. } => "ObjectSync",
            AppMessage::TakeOwnership { .. } => "TakeOwnership",
            AppMessage::Instantiate { .. } => "Instantiate",
            AppMessage::InstantiateWithTransform { .. } => "InstantiateWithTransform",
            AppMessage::InstantiateWithState { .. } => "InstantiateWithState",
            AppMessage::Destroy { .. } => "Destroy",
            AppMessage::DeleteSceneObjects { .. } => "DeleteSceneObjects",
            AppMessage::ForceState { .. } => "ForceState",
            AppMessage::KeepAlive => "KeepAlive",
            AppMessage::Custom { .. } => "Custom",
        }
    }
}

/// Write the `[tag][id][slot byte]` prefix of an object sync payload.
pub fn write_sync_header(w: &mut Writer, network_id: &str, slot: u8, is_rpc: bool) {
    w.write_u8(AppMessage::OBJECT_SYNC);
    w.write_string(network_id);
    w.write_u8((slot << 1) | u8::from(is_rpc));
}

/// Write an `i32` length followed by the bytes.
pub fn write_blob(w: &mut Writer, bytes: &[u8]) {
    w.write_i32(bytes.len() as i32);
    w.write_bytes(bytes);
}

fn read_blob(r: &mut Reader<'_>) -> Result<Vec<u8>, WireError> {
    let n = r.read_len()?;
    Ok(r.read_bytes(n)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_net::{Quat, Vec3};

    fn round_trip(msg: AppMessage) {
        let mut w = Writer::new();
        msg.encode(&mut w);
        assert_eq!(AppMessage::decode(w.as_slice()).unwrap(), msg);
    }

    #[test]
    fn test_sync_slot_byte_packs_rpc_bit() {
        let mut w = Writer::new();
        AppMessage::ObjectSync {
            network_id: "3-0".into(),
            slot: 2,
            is_rpc: true,
            data: vec![0xAB],
        }
        .encode(&mut w);
        assert_eq!(
            w.as_slice(),
            &[0, 3, b'3', b'-', b'0', 0b101, 1, 0, 0, 0, 0xAB]
        );
    }

    #[test]
    fn test_every_payload_decodes() {
        round_trip(AppMessage::ObjectSync {
            network_id: "-1-4".into(),
            slot: MAX_SLOT,
            is_rpc: false,
            data: vec![],
        });
        round_trip(AppMessage::TakeOwnership {
            network_id: "1-1".into(),
        });
        round_trip(AppMessage::Instantiate {
            network_id: "1-2".into(),
            kind: "cube".into(),
        });
        round_trip(AppMessage::InstantiateWithTransform {
            network_id: "1-3".into(),
            kind: "cube".into(),
            transform: Transform {
                position: Vec3::new(1.0, 2.0, 3.0),
                rotation: Quat::IDENTITY,
            },
        });
        round_trip(AppMessage::InstantiateWithState {
            network_id: "1-4".into(),
            kind: "cube".into(),
            state: vec![1, 2, 3],
        });
        round_trip(AppMessage::Destroy {
            network_id: "1-5".into(),
        });
        round_trip(AppMessage::DeleteSceneObjects {
            network_ids: vec!["-1-0".into(), "-1-7".into()],
        });
        round_trip(AppMessage::ForceState {
            network_id: "1-6".into(),
            state: vec![],
        });
        round_trip(AppMessage::KeepAlive);
        round_trip(AppMessage::Custom {
            payload: vec![9; 3],
        });
    }

    #[test]
    fn test_delete_scene_objects_counts_every_id() {
        let mut w = Writer::new();
        AppMessage::DeleteSceneObjects {
            network_ids: vec!["a".into()],
        }
        .encode(&mut w);
        assert_eq!(w.as_slice(), &[6, 1, 0, 0, 0, 1, b'a']);
    }

    #[test]
    fn test_unknown_tag_and_truncation() {
        assert_eq!(AppMessage::decode(&[42]), Err(PayloadError::UnknownTag(42)));
        assert!(matches!(
            AppMessage::decode(&[AppMessage::CUSTOM, 5, 0, 0, 0, 1]),
            Err(PayloadError::Wire(_))
        ));
        assert!(AppMessage::decode(&[]).is_err());
    }
}

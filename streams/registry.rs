/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use super::MediaStream;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

lazy_static! {
    static ref MEDIA_STREAMS_REGISTRY: Mutex<HashMap<MediaStreamId, Arc<Mutex<dyn MediaStream>>>> =
        Mutex::new(HashMap::new());
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct MediaStreamId(Uuid);
impl MediaStreamId {
    pub fn new() -> MediaStreamId {
        Self(Uuid::new_v4())
    }

    pub fn id(self) -> Uuid {
        self.0
    }
}

impl Default for MediaStreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for MediaStreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MediaStreamId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<MediaStreamId, D::Error> {
        let value: &str = Deserialize::deserialize(d)?;
        let uuid = Uuid::from_str(value).map_err(D::Error::custom)?;
        Ok(MediaStreamId(uuid))
    }
}

pub fn register_stream(stream: Arc<Mutex<dyn MediaStream>>) -> MediaStreamId {
    let id = MediaStreamId::new();
    stream.lock().unwrap().set_id(id);
    MEDIA_STREAMS_REGISTRY.lock().unwrap().insert(id, stream);
    id
}

pub fn unregister_stream(stream: &MediaStreamId) {
    MEDIA_STREAMS_REGISTRY.lock().unwrap().remove(stream);
}

pub fn get_stream(stream: &MediaStreamId) -> Option<Arc<Mutex<dyn MediaStream>>> {
    MEDIA_STREAMS_REGISTRY.lock().unwrap().get(stream).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediaStreamType;
    use std::any::Any;

    struct TestStream {
        id: Option<MediaStreamId>,
    }

    impl MediaStream for TestStream {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_mut_any(&mut self) -> &mut dyn Any {
            self
        }

        fn set_id(&mut self, id: MediaStreamId) {
            self.id = Some(id);
        }

        fn ty(&self) -> MediaStreamType {
            MediaStreamType::Video
        }
    }

    #[test]
    fn register_assigns_id_and_resolves() {
        let stream = Arc::new(Mutex::new(TestStream { id: None }));
        let id = register_stream(stream.clone());
        assert_eq!(stream.lock().unwrap().id, Some(id));
        assert!(get_stream(&id).is_some());
        unregister_stream(&id);
        assert!(get_stream(&id).is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(MediaStreamId::new(), MediaStreamId::new());
    }
}

//! Resource abstraction and the immutable resource type registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;

/// Outcome of decoding one serialized resource.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// The resource parsed and validated.
    Success {
        /// The resource name.
        name: String,
        /// The decoded resource.
        resource: T,
    },
    /// The resource parsed far enough to recover its name, but failed
    /// validation. Only watchers of `name` are told about the error.
    ResourceError {
        /// The resource name.
        name: String,
        /// Why the resource was rejected.
        error: Error,
    },
    /// The bytes could not be parsed at all, so no name is known.
    TopLevelError(Error),
}

/// Trait for xDS resources.
///
/// `decode` parses the raw bytes and validates the result. Any error is
/// reported back to the server in the NACK's `error_detail`.
///
/// # Example
///
/// ```ignore
/// impl Resource for Listener {
///     const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.listener.v3.Listener";
///     const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;
///
///     fn decode(bytes: Bytes) -> DecodeResult<Self> {
///         let proto = match ListenerProto::decode(bytes) {
///             Ok(p) => p,
///             Err(e) => return DecodeResult::TopLevelError(Error::Decode(e.to_string())),
///         };
///         // Validate fields...
///         DecodeResult::Success { name: proto.name.clone(), resource: Self::from(proto) }
///     }
///
///     fn name(&self) -> &str {
///         &self.name
///     }
/// }
/// ```
pub trait Resource: Send + Sync + fmt::Debug + 'static {
    /// The xDS type URL for this resource type.
    const TYPE_URL: &'static str;

    /// Whether every state-of-the-world response carries all resources of
    /// this type, so absence from a response means deletion.
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = false;

    /// Decode and validate a resource from its serialized bytes.
    fn decode(bytes: Bytes) -> DecodeResult<Self>
    where
        Self: Sized;

    /// Returns the resource name.
    fn name(&self) -> &str;
}

/// A type-erased decoded resource.
///
/// Cheap to clone; every watcher of a resource shares the same value.
#[derive(Clone)]
pub struct DecodedResource {
    name: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
}

impl DecodedResource {
    /// Wrap a decoded resource.
    pub fn new<T: Resource>(resource: T) -> Self {
        Self {
            name: Arc::from(resource.name()),
            value: Arc::new(resource),
        }
    }

    /// Returns the resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Recover the concrete resource, if it is a `T`.
    pub fn downcast<T: Resource>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Whether two handles point at the same decoded value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for DecodedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedResource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Type-erased decoder for a resource type.
pub type DecoderFn = Arc<dyn Fn(Bytes) -> DecodeResult<DecodedResource> + Send + Sync>;

/// One discovery resource kind: type URL, decoder and SotW semantics.
#[derive(Clone)]
pub struct ResourceType {
    type_url: String,
    decoder: DecoderFn,
    all_resources_required_in_sotw: bool,
}

impl ResourceType {
    /// Describe the resource type implemented by `T`.
    pub fn of<T: Resource>() -> Self {
        let decoder: DecoderFn = Arc::new(|bytes| match T::decode(bytes) {
            DecodeResult::Success { name, resource } => DecodeResult::Success {
                name,
                resource: DecodedResource::new(resource),
            },
            DecodeResult::ResourceError { name, error } => {
                DecodeResult::ResourceError { name, error }
            }
            DecodeResult::TopLevelError(error) => DecodeResult::TopLevelError(error),
        });
        Self {
            type_url: T::TYPE_URL.to_string(),
            decoder,
            all_resources_required_in_sotw: T::ALL_RESOURCES_REQUIRED_IN_SOTW,
        }
    }

    /// Describe a resource type from its parts.
    pub fn new(
        type_url: impl Into<String>,
        decoder: DecoderFn,
        all_resources_required_in_sotw: bool,
    ) -> Self {
        Self {
            type_url: type_url.into(),
            decoder,
            all_resources_required_in_sotw,
        }
    }

    /// The stable type URL.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Whether absence from a SotW response means the resource was deleted.
    pub fn all_resources_required_in_sotw(&self) -> bool {
        self.all_resources_required_in_sotw
    }

    /// Decode one serialized resource of this type.
    pub fn decode(&self, bytes: Bytes) -> DecodeResult<DecodedResource> {
        (self.decoder)(bytes)
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("type_url", &self.type_url)
            .field("decoder", &"<decoder fn>")
            .field(
                "all_resources_required_in_sotw",
                &self.all_resources_required_in_sotw,
            )
            .finish()
    }
}

/// Immutable mapping from type URL to [`ResourceType`].
///
/// Built once and handed to the client in its config; afterwards it is
/// shared read-only by every authority and session.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypeRegistry {
    types: HashMap<String, ResourceType>,
}

impl ResourceTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the resource type implemented by `T`.
    pub fn with<T: Resource>(self) -> Self {
        self.with_type(ResourceType::of::<T>())
    }

    /// Register a resource type. A later registration for the same type URL
    /// replaces the earlier one.
    pub fn with_type(mut self, resource_type: ResourceType) -> Self {
        self.types
            .insert(resource_type.type_url.clone(), resource_type);
        self
    }

    /// Look up a resource type by URL.
    pub fn get(&self, type_url: &str) -> Option<&ResourceType> {
        self.types.get(type_url)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Cluster {
        name: String,
    }

    impl Resource for Cluster {
        const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
        const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

        fn decode(bytes: Bytes) -> DecodeResult<Self> {
            match std::str::from_utf8(&bytes) {
                Ok("") => DecodeResult::TopLevelError(Error::Decode("empty".into())),
                Ok(name) => DecodeResult::Success {
                    name: name.to_string(),
                    resource: Cluster {
                        name: name.to_string(),
                    },
                },
                Err(e) => DecodeResult::TopLevelError(Error::Decode(e.to_string())),
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn registry_lookup_is_by_type_url() {
        let registry = ResourceTypeRegistry::new().with::<Cluster>();
        assert_eq!(registry.len(), 1);

        let rt = registry.get(Cluster::TYPE_URL).unwrap();
        assert!(rt.all_resources_required_in_sotw());
        assert!(registry.get("type.googleapis.com/unknown").is_none());
    }

    #[test]
    fn decoded_resource_downcasts_to_its_type() {
        let rt = ResourceType::of::<Cluster>();
        let DecodeResult::Success { name, resource } = rt.decode(Bytes::from_static(b"c1")) else {
            panic!("expected success");
        };
        assert_eq!(name, "c1");
        assert_eq!(resource.name(), "c1");
        assert_eq!(
            *resource.downcast::<Cluster>().unwrap(),
            Cluster {
                name: "c1".to_string()
            }
        );

        assert!(matches!(
            rt.decode(Bytes::new()),
            DecodeResult::TopLevelError(Error::Decode(_))
        ));
    }
}

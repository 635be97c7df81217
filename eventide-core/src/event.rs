//! Domain events, event sets, and the decoder registry.
//!
//! Every concrete event struct implements [`DomainEvent`], naming itself and
//! its schema version. An aggregate's event enum is an [`EventSet`]: it knows
//! each variant's [`EventType`], how to encode it, and how to register a
//! decoder for every variant in an [`EventRegistry`]. The [`event_set!`]
//! macro writes that plumbing for plain newtype-variant enums.
//!
//! [`event_set!`]: crate::event_set

use std::{collections::HashMap, fmt};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    aggregate::Aggregate,
    codec::{Codec, JsonCodec},
    identity::Identity,
    metadata::Metadata,
    store::CommittedEvent,
};

/// Name and schema version of an event payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType {
    pub name: String,
    pub version: u32,
}

impl EventType {
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// A concrete event payload.
///
/// `NAME` is the stable wire name; bump `VERSION` when the payload shape
/// changes and keep the old struct around for upgraders.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
    const VERSION: u32 = 1;

    #[must_use]
    fn event_type() -> EventType {
        EventType::new(Self::NAME, Self::VERSION)
    }
}

/// The closed set of events an aggregate emits.
///
/// Usually implemented through [`event_set!`](crate::event_set).
pub trait EventSet: Sized + Send + Sync + 'static {
    fn event_type(&self) -> EventType;

    /// Encode the payload of this event.
    ///
    /// # Errors
    ///
    /// Returns the codec error if the payload cannot be serialized.
    fn encode<C: Codec>(&self, codec: &C) -> Result<Vec<u8>, C::Error>;

    /// Register a decoder for every member of the set.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if two members share an event
    /// type.
    fn register<C: Codec>(registry: &mut EventRegistry<Self, C>) -> Result<(), RegistryError>;
}

/// Registration failures, reported once when a registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("event type `{0}` registered twice")]
    Duplicate(EventType),
}

/// Error returned when a stored event cannot be turned back into a typed
/// event.
#[derive(Debug, Error)]
pub enum EventDecodeError<CodecError> {
    #[error("unknown event type `{0}`")]
    UnknownType(EventType),
    #[error("event at {aggregate_id}:{aggregate_sequence} carries no event type metadata")]
    MissingType {
        aggregate_id: Identity,
        aggregate_sequence: u64,
    },
    #[error("failed to decode `{event_type}`: {source}")]
    Codec {
        event_type: EventType,
        #[source]
        source: CodecError,
    },
}

type Decoder<E, C> = fn(&C, &[u8]) -> Result<E, <C as Codec>::Error>;

fn decode_as<E, T, C>(codec: &C, data: &[u8]) -> Result<E, C::Error>
where
    T: DomainEvent,
    E: From<T>,
    C: Codec,
{
    codec.deserialize::<T>(data).map(E::from)
}

/// Decoder table keyed by [`EventType`].
///
/// Built once per event set; lookups at load time never reflect over types.
pub struct EventRegistry<E, C: Codec = JsonCodec> {
    codec: C,
    decoders: HashMap<EventType, Decoder<E, C>>,
}

impl<E, C> EventRegistry<E, C>
where
    E: EventSet,
    C: Codec,
{
    /// Build a registry holding a decoder for every member of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if `E` names an event type twice.
    pub fn new(codec: C) -> Result<Self, RegistryError> {
        let mut registry = Self::empty(codec);
        E::register(&mut registry)?;
        Ok(registry)
    }

    #[must_use]
    pub fn empty(codec: C) -> Self {
        Self {
            codec,
            decoders: HashMap::new(),
        }
    }

    /// Register the decoder for payload type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if `T`'s event type is already
    /// present.
    pub fn register<T>(&mut self) -> Result<(), RegistryError>
    where
        T: DomainEvent,
        E: From<T>,
    {
        let event_type = T::event_type();
        if self.decoders.contains_key(&event_type) {
            return Err(RegistryError::Duplicate(event_type));
        }
        self.decoders.insert(event_type, decode_as::<E, T, C>);
        Ok(())
    }

    pub const fn codec(&self) -> &C {
        &self.codec
    }

    #[must_use]
    pub fn contains(&self, event_type: &EventType) -> bool {
        self.decoders.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &EventType> {
        self.decoders.keys()
    }

    /// Encode an event, returning its type alongside the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns the codec error if serialization fails.
    pub fn encode(&self, event: &E) -> Result<(EventType, Vec<u8>), C::Error> {
        Ok((event.event_type(), event.encode(&self.codec)?))
    }

    /// Decode a payload of a known type.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownType`] if no decoder is registered
    /// for `event_type`, or [`EventDecodeError::Codec`] if the bytes are
    /// malformed.
    pub fn decode(
        &self,
        event_type: &EventType,
        data: &[u8],
    ) -> Result<E, EventDecodeError<C::Error>> {
        let decoder = self
            .decoders
            .get(event_type)
            .ok_or_else(|| EventDecodeError::UnknownType(event_type.clone()))?;
        decoder(&self.codec, data).map_err(|source| EventDecodeError::Codec {
            event_type: event_type.clone(),
            source,
        })
    }

    /// Decode a committed event into a typed envelope.
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode). Also fails with
    /// [`EventDecodeError::MissingType`] when the metadata has no event type.
    pub fn decode_committed(
        &self,
        event: &CommittedEvent,
    ) -> Result<EventEnvelope<E>, EventDecodeError<C::Error>> {
        let event_type = event
            .metadata
            .event_type()
            .ok_or_else(|| EventDecodeError::MissingType {
                aggregate_id: event.aggregate_id.clone(),
                aggregate_sequence: event.aggregate_sequence,
            })?;
        let payload = self.decode(&event_type, &event.data)?;
        Ok(EventEnvelope::from_committed(event, payload))
    }
}

/// A typed event together with its position and metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope<E> {
    pub aggregate_id: Identity,
    pub aggregate_sequence: u64,
    pub global_sequence: u64,
    pub event: E,
    pub metadata: Metadata,
}

impl<E> EventEnvelope<E> {
    #[must_use]
    pub fn from_committed(committed: &CommittedEvent, event: E) -> Self {
        Self {
            aggregate_id: committed.aggregate_id.clone(),
            aggregate_sequence: committed.aggregate_sequence,
            global_sequence: committed.global_sequence,
            event,
            metadata: committed.metadata.clone(),
        }
    }

    /// Swap the payload, keeping position and metadata.
    #[must_use]
    pub fn with_event<F>(self, event: F) -> EventEnvelope<F> {
        EventEnvelope {
            aggregate_id: self.aggregate_id,
            aggregate_sequence: self.aggregate_sequence,
            global_sequence: self.global_sequence,
            event,
            metadata: self.metadata,
        }
    }
}

/// Routing key for event handlers: which aggregate kind emitted which event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub aggregate: String,
    pub event_type: EventType,
}

impl EventKey {
    #[must_use]
    pub fn new(aggregate: impl Into<String>, event_type: EventType) -> Self {
        Self {
            aggregate: aggregate.into(),
            event_type,
        }
    }

    /// Key of a committed event, if its metadata names both parts.
    #[must_use]
    pub fn of(event: &CommittedEvent) -> Option<Self> {
        Some(Self {
            aggregate: event.metadata.aggregate_name()?.to_owned(),
            event_type: event.metadata.event_type()?,
        })
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate, self.event_type)
    }
}

/// Problems found while building a handler table. Reported once, at
/// startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("handler for `{0}` registered twice")]
    DuplicateHandler(EventKey),
    #[error("aggregate `{aggregate}` never emits `{event_type}`")]
    NotEmitted {
        aggregate: &'static str,
        event_type: EventType,
    },
    #[error("event set of aggregate `{aggregate}` is invalid: {source}")]
    Registry {
        aggregate: &'static str,
        #[source]
        source: RegistryError,
    },
    #[error("definition has no handlers")]
    NoHandlers,
    #[error("saga definition has no start trigger")]
    NoStartTrigger,
}

/// A registered handler could not decode the event routed to it.
#[derive(Debug, Error)]
#[error("failed to decode `{key}` at {aggregate_id}:{aggregate_sequence}: {source}")]
pub struct HandlerDecodeError<CodecError> {
    pub key: EventKey,
    pub aggregate_id: Identity,
    pub aggregate_sequence: u64,
    #[source]
    pub source: CodecError,
}

impl<CodecError> HandlerDecodeError<CodecError> {
    pub(crate) fn new(key: EventKey, event: &CommittedEvent, source: CodecError) -> Self {
        Self {
            key,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_sequence: event.aggregate_sequence,
            source,
        }
    }
}

/// Key for a handler of `T` events emitted by `A`, after checking that `A`
/// really emits `T`.
pub(crate) fn handler_key<A, T, C>(codec: &C) -> Result<EventKey, DefinitionError>
where
    A: Aggregate,
    T: DomainEvent,
    C: Codec,
{
    let registry = EventRegistry::<A::Event, C>::new(codec.clone()).map_err(|source| {
        DefinitionError::Registry {
            aggregate: A::KIND,
            source,
        }
    })?;
    let event_type = T::event_type();
    if !registry.contains(&event_type) {
        return Err(DefinitionError::NotEmitted {
            aggregate: A::KIND,
            event_type,
        });
    }
    Ok(EventKey::new(A::KIND, event_type))
}

/// Declare an event enum whose variants each wrap one [`DomainEvent`].
///
/// Generates the enum, a `From` conversion per variant, and the
/// [`EventSet`] implementation.
///
/// ```ignore
/// event_set! {
///     #[derive(Clone, Debug, PartialEq)]
///     pub enum AccountEvent {
///         Opened(AccountOpened),
///         Deposited(FundsDeposited),
///     }
/// }
/// ```
#[macro_export]
macro_rules! event_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident ( $event:ty ) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $variant($event), )+
        }

        $(
            impl ::core::convert::From<$event> for $name {
                fn from(event: $event) -> Self {
                    Self::$variant(event)
                }
            }
        )+

        impl $crate::event::EventSet for $name {
            fn event_type(&self) -> $crate::event::EventType {
                match self {
                    $( Self::$variant(_) => <$event as $crate::event::DomainEvent>::event_type(), )+
                }
            }

            fn encode<C: $crate::codec::Codec>(
                &self,
                codec: &C,
            ) -> ::core::result::Result<::std::vec::Vec<u8>, C::Error> {
                match self {
                    $( Self::$variant(event) => codec.serialize(event), )+
                }
            }

            fn register<C: $crate::codec::Codec>(
                registry: &mut $crate::event::EventRegistry<Self, C>,
            ) -> ::core::result::Result<(), $crate::event::RegistryError> {
                $( registry.register::<$event>()?; )+
                ::core::result::Result::Ok(())
            }
        }
    };
}

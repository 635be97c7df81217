#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    CancellationToken, NonEmpty, aggregate,
    aggregate::{Aggregate, AggregateRoot, Apply, Handle},
    codec,
    codec::{Codec, JsonCodec},
    config,
    config::EventideConfig,
    event,
    event::{DomainEvent, EventEnvelope, EventSet},
    event_set,
    identity::{Identity, SourceId},
    metadata,
    metadata::Metadata,
    projection,
    projection::{
        ApplyOutcome, ApplyReadModel, ProjectionManager, ReadModel, ReadModelDefinition,
        ReadModelProjector,
    },
    publisher,
    publisher::{EventPublisher, EventSubscriber},
    repository,
    repository::{Repository, UpdateError},
    retry::RetryPolicy,
    saga,
    saga::{Saga, SagaCoordinator, SagaDefinition},
    upgrade,
};

pub mod store {
    pub use eventide_core::store::{
        CommitError, CommittedEvent, EventLog, EventPage, GlobalPosition, SequenceRange,
        SerializedEvent,
    };

    pub use eventide_core::store::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::{Error, Store};
    }
}

pub mod recovery {
    pub use eventide_core::recovery::{
        PublishAckLog, PublishRecoveryLoop, PublishVerificationItem, RecoveryError,
        RecoveryHandler, RepublishRecovery, VerifyOutcome,
    };

    pub use eventide_core::recovery::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::ack::AckLog;
    }
}

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    //! `PostgreSQL` read model tables.
    pub use eventide_postgres::read_model::ReadModelTable;
}

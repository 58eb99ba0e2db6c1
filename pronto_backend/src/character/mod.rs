pub mod abby;
pub mod contract;
pub mod profile;
pub mod store;

pub use contract::{ContractField, FieldType, Reaction};
pub use profile::{BioSection, CharacterProfile, InternalState, ProfileSummary};
pub use store::ProfileStore;

use uuid::Uuid;

pub(crate) mod encoding;
pub(crate) mod hash;
pub(crate) mod time;

pub type EntityId = String;

pub(crate) fn generate_entity_id() -> EntityId {
    Uuid::new_v4().to_string()
}

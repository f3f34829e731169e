pub mod prelude;

pub mod email_enrichment;
pub mod email_metadata;
pub mod outlook_connection;
pub mod sea_orm_active_enums;

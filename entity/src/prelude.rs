pub use super::email_enrichment::Entity as EmailEnrichment;
pub use super::email_metadata::Entity as EmailMetadata;
pub use super::outlook_connection::Entity as OutlookConnection;
pub use super::sea_orm_active_enums::AiStatus;

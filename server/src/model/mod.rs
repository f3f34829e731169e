pub mod email_metadata;
pub mod enrichment;
pub mod outlook_connection;

pub use email_metadata::EmailMetadataCtrl;
pub use enrichment::EnrichmentCtrl;
pub use outlook_connection::OutlookConnectionCtrl;

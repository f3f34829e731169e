pub mod ai;
pub mod app_router;
pub mod emails;

pub use app_router::AppRouter;

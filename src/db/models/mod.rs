//! Database models, one file per aggregate.
//! Everything is re-exported so callers can `use crate::db::models::*;`.

pub mod access_request;
pub mod entity;
pub mod invitation;
pub mod link_settings;
pub mod membership;
pub mod patch;
pub mod role;
pub mod user;

pub use self::access_request::*;
pub use self::entity::*;
pub use self::invitation::*;
pub use self::link_settings::*;
pub use self::membership::*;
pub use self::patch::*;
pub use self::role::*;
pub use self::user::*;

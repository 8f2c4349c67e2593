pub mod access_request;
pub mod entity;
pub mod invitation;
pub mod link_settings;
pub mod membership;
pub mod user;

pub use access_request::AccessRequestRepository;
pub use entity::EntityRepository;
pub use invitation::InvitationRepository;
pub use link_settings::LinkSettingsRepository;
pub use membership::MembershipRepository;
pub use user::UserRepository;

pub mod access;
pub mod access_requests;
pub mod auth;
pub mod entities;
pub mod hierarchy;
pub mod init;
pub mod invitations;
pub mod members;
pub mod notifier;
pub mod tokens;

#[cfg(test)]
pub mod test_support;

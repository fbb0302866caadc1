mod auth;
mod client;

pub use auth::{AuthClient, AuthError, TokenGrant};
pub use client::{
    ApiError, ApiErrorClass, DriveClient, DriveInfo, Resource, ResourceKind, ResourceList,
    TransferLink,
};

pub mod clients;
pub mod roles;
pub mod tenants;
pub mod users;

pub use clients::create_client;
pub use roles::{create_permission, create_role, delete_role, update_role};
pub use tenants::{create_tenant, list_tenants, rotate_tenant_key};
pub use users::{
    add_user_permission, assign_role, create_user, list_user_permissions, unassign_role,
};

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datasets::Dataset;
use crate::error::ImportError;

/// Functional areas a tenant can switch on per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Processing,
    Rainfall,
    Dispatch,
    Sales,
    Inventory,
    Accounts,
}

impl Module {
    pub const ALL: [Module; 6] = [
        Module::Processing,
        Module::Rainfall,
        Module::Dispatch,
        Module::Sales,
        Module::Inventory,
        Module::Accounts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Processing => "processing",
            Module::Rainfall => "rainfall",
            Module::Dispatch => "dispatch",
            Module::Sales => "sales",
            Module::Inventory => "inventory",
            Module::Accounts => "accounts",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|module| module.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown module '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Owner,
    User,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::User => "user",
            Role::Viewer => "viewer",
        }
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Admins and owners may inspect any import job of their tenant.
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            "user" => Ok(Role::User),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated caller, as supplied by the session layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub tenant_id: Uuid,
    pub username: String,
    pub user_id: Option<Uuid>,
    pub role: Role,
    pub modules: HashSet<Module>,
}

impl Principal {
    pub fn new(tenant_id: Uuid, username: impl Into<String>, role: Role) -> Self {
        Self {
            tenant_id,
            username: username.into(),
            user_id: None,
            role,
            modules: Module::ALL.into_iter().collect(),
        }
    }

    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = Module>) -> Self {
        self.modules = modules.into_iter().collect();
        self
    }

    pub fn has_module(&self, module: Module) -> bool {
        self.modules.contains(&module)
    }
}

pub fn ensure_import_access(principal: &Principal, dataset: Dataset) -> Result<(), ImportError> {
    if !principal.role.can_write() {
        return Err(ImportError::ReadOnlyRole {
            role: principal.role,
        });
    }
    let module = dataset.module();
    if !principal.has_module(module) {
        return Err(ImportError::ModuleDisabled { module });
    }
    Ok(())
}

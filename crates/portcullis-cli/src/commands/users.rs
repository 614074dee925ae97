//! Local account management.

use std::path::Path;

use anyhow::{Context, Result};
use portcullis_core::User;
use portcullis_core::types::normalize_role;
use portcullis_gateway::auth::{Account, UserStore};
use rand::Rng;

use crate::ui;

/// Users command actions.
#[derive(Debug, Clone)]
pub enum UsersAction {
    /// Create or update an account.
    Add {
        /// Login name.
        login: String,
        /// Password; prompted for when absent.
        password: Option<String>,
        /// Generate a random password.
        generate_password: bool,
        /// Roles granted to the account.
        roles: Vec<String>,
    },
    /// List accounts.
    List,
    /// Remove an account by id.
    Remove {
        /// Account id.
        id: i64,
        /// Skip the confirmation prompt.
        yes: bool,
    },
}

/// Run the users command.
///
/// # Errors
///
/// Returns error if the accounts file cannot be read or written.
pub fn run_users(config_file: Option<&Path>, action: UsersAction) -> Result<()> {
    let config = super::load_config(config_file)?;
    let store = UserStore::new(config.auth.users_file);

    match action {
        UsersAction::Add {
            login,
            password,
            generate_password: generate,
            roles,
        } => add_user(&store, &login, password, generate, &roles, &config.auth.admin_role),
        UsersAction::List => list_users(&store),
        UsersAction::Remove { id, yes } => remove_user(&store, id, yes),
    }
}

fn add_user(
    store: &UserStore,
    login: &str,
    password: Option<String>,
    generate: bool,
    roles: &[String],
    admin_role: &str,
) -> Result<()> {
    let password = if generate {
        let generated = generate_password(16);
        ui::success(&format!("Generated password: {generated}"));
        generated
    } else if let Some(password) = password {
        password
    } else {
        ui::prompts::new_password(&format!("Password for {login}"))?
    };

    let existing = store.get_by_login(login)?;
    let user = User {
        id: existing.as_ref().map_or(0, |a| a.user.id),
        login: login.to_string(),
        roles: roles.iter().map(|r| normalize_role(r)).collect(),
        ..existing.map(|a| a.user).unwrap_or_default()
    };
    let account = store
        .upsert(Account::new(user, &password)?)
        .context("Failed to save account")?;

    ui::success(&format!(
        "Saved user '{}' (id {}) with roles [{}]",
        account.user.login,
        account.user.id,
        account.user.roles.join(", ")
    ));
    if !account.user.has_role(admin_role) {
        ui::info(&format!("Grant the '{admin_role}' role for administrator access"));
    }
    Ok(())
}

fn list_users(store: &UserStore) -> Result<()> {
    let accounts = store.list()?;
    if accounts.is_empty() {
        ui::info("No users configured.");
        ui::info("Run 'portcullis users add <login> --generate-password' to create one.");
        return Ok(());
    }

    ui::info(&format!("Users ({}):", accounts.len()));
    println!();
    ui::table_row(&[("ID", 6), ("LOGIN", 20), ("NAME", 24), ("ROLES", 0)]);
    for account in &accounts {
        let user = &account.user;
        let id = user.id.to_string();
        let roles = user.roles.join(",");
        ui::table_row(&[
            (id.as_str(), 6),
            (user.login.as_str(), 20),
            (user.display_name.as_str(), 24),
            (roles.as_str(), 0),
        ]);
    }
    Ok(())
}

fn remove_user(store: &UserStore, id: i64, yes: bool) -> Result<()> {
    let Some(account) = store.list()?.into_iter().find(|a| a.user.id == id) else {
        anyhow::bail!("No user with id {id}");
    };
    if !yes && !ui::prompts::confirm(&format!("Remove user '{}'?", account.user.login))? {
        ui::info("Cancelled");
        return Ok(());
    }
    store.delete(id)?;
    ui::success(&format!("Removed user '{}'", account.user.login));
    Ok(())
}

/// Random password drawn from letters, digits and symbols.
pub fn generate_password(length: usize) -> String {
    const CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
    let mut rng = rand::thread_rng();

    (0..length)
        .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
        .collect()
}

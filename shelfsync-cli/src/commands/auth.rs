//! `shelfsync auth set` / `shelfsync auth clear`: the only way to provide
//! the remote backend's API key, resolved from the OS keyring, never
//! from environment variables or config files.

use dialoguer::Password;
use shelfsync_config::CredentialStore;

pub fn set(store_name: &str) -> anyhow::Result<()> {
    let secret = Password::new()
        .with_prompt(format!("API key for store '{store_name}'"))
        .interact()?;
    CredentialStore::for_store(store_name).set_api_key(&secret)?;
    println!("stored API key for store '{store_name}' in the OS keyring");
    Ok(())
}

pub fn clear(store_name: &str) -> anyhow::Result<()> {
    CredentialStore::for_store(store_name).clear_api_key()?;
    println!("cleared API key for store '{store_name}'");
    Ok(())
}

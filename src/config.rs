// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;

use crate::crypto;

pub const LOCAL_CONFIG_FILE: &str = ".dtctl.yaml";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_dtkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_dtkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacert: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    User,
}

/// Where configuration is read from and written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// User file overlaid by the local project file.
    Layered,
    /// One explicit file given with `--config-file`.
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Host,
    PubDtkey,
    Dtkey,
    SecureDtkey,
    Cacert,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate a writable config directory for the current user")]
    MissingConfigDir,
    #[error("Host not specified or configured; set it with `dtctl config set host --value <url>`")]
    MissingHost,
    #[error(
        "pub-dtkey not specified or configured; set it with `dtctl config set pub-dtkey --value <key>`"
    )]
    MissingPublicKey,
    #[error("a value is required for {0}")]
    MissingValue(&'static str),
}

/// Values supplied on the command line for this invocation.
#[derive(Debug, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub pub_dtkey: Option<String>,
    pub priv_dtkey: Option<String>,
    pub cacert: Option<PathBuf>,
    pub insecure: bool,
}

#[derive(Debug)]
pub struct EffectiveConfig {
    pub host: String,
    pub public_key: String,
    pub private_key: String,
    pub cacert: Option<PathBuf>,
    pub insecure: bool,
}

impl Key {
    pub const ALL: [Key; 5] = [
        Key::Host,
        Key::PubDtkey,
        Key::Dtkey,
        Key::SecureDtkey,
        Key::Cacert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Key::Host => "host",
            Key::PubDtkey => "pub-dtkey",
            Key::Dtkey => "dtkey",
            Key::SecureDtkey => "secure-dtkey",
            Key::Cacert => "cacert",
        }
    }

    pub fn is_secret(self) -> bool {
        matches!(self, Key::Dtkey | Key::SecureDtkey)
    }
}

impl Config {
    pub fn get(&self, key: Key) -> Option<&str> {
        match key {
            Key::Host => self.host.as_deref(),
            Key::PubDtkey => self.pub_dtkey.as_deref(),
            Key::Dtkey => self.dtkey.as_deref(),
            Key::SecureDtkey => self.secure_dtkey.as_deref(),
            Key::Cacert => self.cacert.as_deref(),
        }
    }

    pub fn set(&mut self, key: Key, value: String) {
        let slot = match key {
            Key::Host => &mut self.host,
            Key::PubDtkey => &mut self.pub_dtkey,
            Key::Dtkey => &mut self.dtkey,
            Key::SecureDtkey => &mut self.secure_dtkey,
            Key::Cacert => &mut self.cacert,
        };
        *slot = Some(value);
    }
}

pub fn config_path(scope: Scope, cwd: &Path) -> Result<PathBuf> {
    match scope {
        Scope::Local => Ok(cwd.join(LOCAL_CONFIG_FILE)),
        Scope::User => {
            if let Ok(custom) = env::var("DTCTL_CONFIG_DIR") {
                return Ok(PathBuf::from(custom).join("config.yaml"));
            }
            let base = config_dir().ok_or(ConfigError::MissingConfigDir)?;
            Ok(base.join("dtctl").join("config.yaml"))
        }
    }
}

pub fn load(source: &Source, cwd: &Path) -> Result<Config> {
    match source {
        Source::File(path) => Ok(read_if_exists(path)?.unwrap_or_default()),
        Source::Layered => {
            let user = read_if_exists(&config_path(Scope::User, cwd)?)?.unwrap_or_default();
            let local = read_if_exists(&config_path(Scope::Local, cwd)?)?.unwrap_or_default();
            Ok(merge(user, local))
        }
    }
}

/// The file `config set` writes to: the explicit file if one was given,
/// otherwise the file for `scope`.
pub fn target_path(source: &Source, scope: Scope, cwd: &Path) -> Result<PathBuf> {
    match source {
        Source::File(path) => Ok(path.clone()),
        Source::Layered => config_path(scope, cwd),
    }
}

pub fn load_path(path: &Path) -> Result<Config> {
    Ok(read_if_exists(path)?.unwrap_or_default())
}

pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let serialized = serde_yaml::to_string(config).context("serializing config")?;
    fs::write(path, serialized).with_context(|| format!("writing {:?}", path))?;
    Ok(())
}

/// Merges command line values over the loaded config. `prompt` is asked for
/// the secure-key password, or for the private key itself when none is stored.
pub fn resolve<F>(source: &Source, cwd: &Path, overrides: Overrides, prompt: F) -> Result<EffectiveConfig>
where
    F: Fn(&str) -> Result<String>,
{
    let merged = load(source, cwd)?;

    let host = overrides
        .host
        .or(merged.host)
        .map(|h| h.trim().trim_end_matches('/').to_string())
        .filter(|h| !h.is_empty())
        .ok_or(ConfigError::MissingHost)?;

    let public_key = overrides
        .pub_dtkey
        .or(merged.pub_dtkey)
        .map(|k| k.trim().to_string())
        .ok_or(ConfigError::MissingPublicKey)?;

    let private_key = match (overrides.priv_dtkey, merged.dtkey, merged.secure_dtkey) {
        (Some(key), _, _) => key,
        (None, Some(key), _) => {
            warn!("using the plaintext dtkey from the config file; consider storing secure-dtkey");
            key
        }
        (None, None, Some(secured)) => {
            let password = prompt("Password: ")?;
            crypto::decrypt(&password, &secured)?
        }
        (None, None, None) => prompt("Private API key: ")?,
    };

    let cacert = overrides.cacert.or(merged.cacert.map(PathBuf::from));

    Ok(EffectiveConfig {
        host,
        public_key,
        private_key: private_key.trim().to_string(),
        cacert,
        insecure: overrides.insecure || merged.insecure,
    })
}

fn read_if_exists(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let config = serde_yaml::from_str(&contents).with_context(|| format!("parsing {:?}", path))?;
    Ok(Some(config))
}

fn merge(user: Config, local: Config) -> Config {
    Config {
        host: local.host.or(user.host),
        pub_dtkey: local.pub_dtkey.or(user.pub_dtkey),
        dtkey: local.dtkey.or(user.dtkey),
        secure_dtkey: local.secure_dtkey.or(user.secure_dtkey),
        cacert: local.cacert.or(user.cacert),
        insecure: local.insecure || user.insecure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::OnceLock;
    use std::{env, fs};
    use tempfile::tempdir;

    static ENV_LOCK: OnceLock<std::sync::Mutex<()>> = OnceLock::new();

    fn no_prompt(_: &str) -> Result<String> {
        bail!("unexpected prompt")
    }

    #[test]
    fn test_merges_user_and_local_and_overrides() {
        let _guard = ENV_LOCK
            .get_or_init(|| std::sync::Mutex::new(()))
            .lock()
            .unwrap();
        let cwd = tempdir().unwrap();
        unsafe {
            env::set_var("DTCTL_CONFIG_DIR", cwd.path().join("config"));
        }
        fs::create_dir_all(cwd.path().join("config")).unwrap();

        let user_cfg = Config {
            host: Some("https://user.example/".into()),
            pub_dtkey: Some("user-pub".into()),
            dtkey: Some("user-priv".into()),
            ..Default::default()
        };
        save(&config_path(Scope::User, cwd.path()).unwrap(), &user_cfg).unwrap();

        let local_cfg = Config {
            pub_dtkey: Some("local-pub".into()),
            insecure: true,
            ..Default::default()
        };
        save(&config_path(Scope::Local, cwd.path()).unwrap(), &local_cfg).unwrap();

        let effective =
            resolve(&Source::Layered, cwd.path(), Overrides::default(), no_prompt).unwrap();
        assert_eq!(effective.host, "https://user.example");
        assert_eq!(effective.public_key, "local-pub");
        assert_eq!(effective.private_key, "user-priv");
        assert!(effective.insecure);

        let overrides = Overrides {
            host: Some("https://cli.example".into()),
            priv_dtkey: Some("cli-priv".into()),
            ..Default::default()
        };
        let effective = resolve(&Source::Layered, cwd.path(), overrides, no_prompt).unwrap();
        assert_eq!(effective.host, "https://cli.example");
        assert_eq!(effective.private_key, "cli-priv");
    }

    #[test]
    fn test_explicit_file_replaces_layered_lookup() {
        let _guard = ENV_LOCK
            .get_or_init(|| std::sync::Mutex::new(()))
            .lock()
            .unwrap();
        let cwd = tempdir().unwrap();
        unsafe {
            env::set_var("DTCTL_CONFIG_DIR", cwd.path().join("config"));
        }
        save(
            &config_path(Scope::User, cwd.path()).unwrap(),
            &Config {
                host: Some("https://user.example".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let explicit = cwd.path().join("other.yaml");
        fs::write(&explicit, "host: https://file.example\npub-dtkey: p\ndtkey: s\n").unwrap();

        let source = Source::File(explicit.clone());
        let effective = resolve(&source, cwd.path(), Overrides::default(), no_prompt).unwrap();
        assert_eq!(effective.host, "https://file.example");
        assert_eq!(target_path(&source, Scope::User, cwd.path()).unwrap(), explicit);
    }

    #[test]
    fn test_decrypts_secure_key_with_prompted_password() {
        let _guard = ENV_LOCK
            .get_or_init(|| std::sync::Mutex::new(()))
            .lock()
            .unwrap();
        let cwd = tempdir().unwrap();
        let path = cwd.path().join("dtctl.yaml");
        let mut config = Config::default();
        config.set(Key::Host, "https://appliance.example".into());
        config.set(Key::PubDtkey, "pub".into());
        config.set(Key::SecureDtkey, crypto::encrypt("hunter2", "secret-key"));
        save(&path, &config).unwrap();

        let effective = resolve(&Source::File(path.clone()), cwd.path(), Overrides::default(), |_| {
            Ok("hunter2".to_string())
        })
        .unwrap();
        assert_eq!(effective.private_key, "secret-key");

        let err = resolve(&Source::File(path), cwd.path(), Overrides::default(), |_| {
            Ok("wrong".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("Password incorrect"));
    }

    #[test]
    fn test_errors_when_missing_host() {
        let _guard = ENV_LOCK
            .get_or_init(|| std::sync::Mutex::new(()))
            .lock()
            .unwrap();
        let cwd = tempdir().unwrap();
        unsafe {
            env::set_var("DTCTL_CONFIG_DIR", cwd.path().join("config"));
        }
        let err = resolve(&Source::Layered, cwd.path(), Overrides::default(), no_prompt)
            .unwrap_err();
        assert!(err.to_string().contains("Host not specified or configured"));
    }

    #[test]
    fn test_serializes_kebab_case_keys() {
        let mut config = Config::default();
        config.set(Key::PubDtkey, "abc".into());
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(yaml.trim(), "pub-dtkey: abc");
        assert_eq!(config.get(Key::PubDtkey), Some("abc"));
        assert!(Key::SecureDtkey.is_secret());
    }
}

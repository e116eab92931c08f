use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Environment variable prefix for config overrides. A field `rpc.bind_addr`
/// is overridden by `CARAVEL__RPC__BIND_ADDR`.
const ENV_PREFIX: &str = "CARAVEL__";
const ENV_SEPARATOR: &str = "__";

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

/// Loads a config struct by layering, in increasing precedence: the struct's
/// `Default`, a TOML file, and prefixed environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: std::marker::PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom: std::marker::PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Normal startup path: loads the config, except when `--dump-config` was
    /// passed, in which case the effective config is printed as TOML and
    /// `None` is returned so the caller exits without serving.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            match self.load() {
                Ok(config) => match toml::to_string(&config) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => eprintln!("Failed to render config: {err}"),
                },
                Err(err) => eprintln!("Failed to load config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

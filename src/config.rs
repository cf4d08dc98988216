//! Client configuration and the catalog of known vendor installations.

use crate::buffer::Quirks;
use crate::job::{ReadPolicy, WritePolicy};
use crate::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Everything needed to talk to one account on one installation.
#[derive(Clone, Deserialize)]
pub struct ClientConfig {
    pub api_url: String,
    pub customer_code: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    /// Identity registered with `/appSignup` and sent as authorization on login.
    #[serde(default)]
    pub unique_id: String,
    /// Separate login bridge some brands authenticate through.
    #[serde(default)]
    pub login_api_url: Option<String>,
    #[serde(default)]
    pub brand_id: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default = "default_application_version")]
    pub application_version: String,
    #[serde(default)]
    pub air_temp_fix: bool,
    #[serde(default)]
    pub reading_error_fix: bool,
    /// Preferred `enc_val` language.
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub buffer_read_timeout: Duration,
}

fn default_application_version() -> String {
    String::from("1.9.7")
}

fn default_language() -> String {
    String::from("ENG")
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("customer_code", &self.customer_code)
            .field("email", &self.email)
            .field("password", &"***")
            .field("unique_id", &self.unique_id)
            .field("login_api_url", &self.login_api_url)
            .field("brand_id", &self.brand_id)
            .field("brand", &self.brand)
            .field("application_version", &self.application_version)
            .field("air_temp_fix", &self.air_temp_fix)
            .field("reading_error_fix", &self.reading_error_fix)
            .field("language", &self.language)
            .field("http_timeout", &self.http_timeout)
            .field("buffer_read_timeout", &self.buffer_read_timeout)
            .finish()
    }
}

impl ClientConfig {
    /// Configuration for `endpoint` with every optional setting at its default.
    pub fn from_endpoint(
        endpoint: &Endpoint,
        email: impl Into<String>,
        password: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        Self {
            api_url: endpoint.api_url.to_string(),
            customer_code: endpoint.customer_code.to_string(),
            email: email.into(),
            password: password.into(),
            unique_id: unique_id.into(),
            login_api_url: endpoint.login_api_url.map(str::to_string),
            brand_id: endpoint.brand_id.map(str::to_string),
            brand: endpoint.brand.map(str::to_string),
            application_version: default_application_version(),
            air_temp_fix: false,
            reading_error_fix: false,
            language: default_language(),
            http_timeout: default_timeout(),
            buffer_read_timeout: default_timeout(),
        }
    }

    /// Reads a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = std::fs::File::open(path).map_err(|err| {
            Error::Configuration(format!("Cannot open config file {}: {err}", path.display()))
        })?;
        serde_yaml::from_reader(file).map_err(|err| {
            Error::Configuration(format!("Cannot parse config file {}: {err}", path.display()))
        })
    }

    /// Base URL without trailing slashes.
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn quirks(&self) -> Quirks {
        Quirks {
            reading_error_fix: self.reading_error_fix,
            air_temp_fix: self.air_temp_fix,
        }
    }

    pub fn read_policy(&self) -> ReadPolicy {
        ReadPolicy {
            timeout: self.buffer_read_timeout,
            ..ReadPolicy::default()
        }
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy::default()
    }
}

/// A vendor installation of the Agua IOT cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// App name the brand ships under.
    pub name: &'static str,
    pub customer_code: &'static str,
    pub api_url: &'static str,
    pub login_api_url: Option<&'static str>,
    pub brand_id: Option<&'static str>,
    pub brand: Option<&'static str>,
}

impl Endpoint {
    const fn new(name: &'static str, customer_code: &'static str, api_url: &'static str) -> Self {
        Self {
            name,
            customer_code,
            api_url,
            login_api_url: None,
            brand_id: None,
            brand: None,
        }
    }

    /// Looks up an endpoint by app name, ignoring case.
    pub fn find(name: &str) -> Option<&'static Endpoint> {
        ENDPOINTS
            .iter()
            .find(|endpoint| endpoint.name.eq_ignore_ascii_case(name))
    }
}

const PIAZZETTA_LOGIN: &str = "https://piazzetta-iot.app2cloud.it/api/bridge/endpoint/";

pub static ENDPOINTS: &[Endpoint] = &[
    Endpoint::new("Alfapalm", "862148", "https://alfaplam.agua-iot.com"),
    Endpoint::new("APP-O BIOEN", "289982", "https://unical.agua-iot.com"),
    Endpoint::new("Boreal Home", "173118", "https://boreal.agua-iot.com"),
    Endpoint::new("Bronpi Home", "164873", "https://bronpi.agua-iot.com"),
    Endpoint::new("Darwin Evolution", "475219", "https://cola.agua-iot.com"),
    Endpoint::new("Easy Connect", "354924", "https://remote.mcz.it"),
    Endpoint::new("Easy Connect Plus", "746318", "https://remote.mcz.it"),
    Endpoint::new("Easy Connect Poêle", "354925", "https://remote.mcz.it"),
    Endpoint::new("Elfire Wifi", "402762", "https://elfire.agua-iot.com"),
    Endpoint::new("EvaCalòr - PuntoFuoco", "635987", "https://evastampaggi.agua-iot.com"),
    Endpoint::new("Fontana Forni", "505912", "https://fontanaforni.agua-iot.com"),
    Endpoint::new("Fonte Flamme contrôle 1", "848324", "https://fonteflame.agua-iot.com"),
    Endpoint::new("Globe-fire", "634876", "https://globefire.agua-iot.com"),
    Endpoint::new("GO HEAT", "859435", "https://amg.agua-iot.com"),
    Endpoint::new("Jolly Mec Wi Fi", "732584", "https://jollymec.agua-iot.com"),
    Endpoint::new("Karmek Wifi", "403873", "https://karmekone.agua-iot.com"),
    Endpoint::new("Klover Home", "143789", "https://klover.agua-iot.com"),
    Endpoint::new("LAMINOX Remote Control (2.0)", "352678", "https://laminox.agua-iot.com"),
    Endpoint::new("Lorflam Home", "121567", "https://lorflam.agua-iot.com"),
    Endpoint::new("Moretti design", "624813", "https://moretti.agua-iot.com"),
    Endpoint::new("My Corisit", "101427", "https://mycorisit.agua-iot.com"),
    Endpoint {
        login_api_url: Some(PIAZZETTA_LOGIN),
        ..Endpoint::new("MyPiazzetta", "458632", "https://piazzetta.agua-iot.com")
    },
    Endpoint {
        login_api_url: Some(PIAZZETTA_LOGIN),
        brand_id: Some("2"),
        brand: Some("superior"),
        ..Endpoint::new("MySuperior", "458632", "https://piazzetta.agua-iot.com")
    },
    Endpoint::new("Nina", "999999", "https://micronova.agua-iot.com"),
    Endpoint::new("Nobis-Fi", "700700", "https://nobis.agua-iot.com"),
    Endpoint::new("Nordic Fire 2.0", "132678", "https://nordicfire.agua-iot.com"),
    Endpoint::new("Ravelli Wi-Fi", "953712", "https://aico.agua-iot.com"),
    Endpoint::new("Stufe a pellet Italia", "015142", "https://stufepelletitalia.agua-iot.com"),
    Endpoint::new("Thermoflux", "391278", "https://thermoflux.agua-iot.com"),
    Endpoint::new("TS Smart", "046629", "https://timsistem.agua-iot.com"),
    Endpoint::new("Wi-Phire", "521228", "https://lineavz.agua-iot.com"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_defaults() {
        let config: ClientConfig = serde_yaml::from_str(
            "api_url: https://micronova.agua-iot.com/\n\
             customer_code: '999999'\n\
             email: someone@example.com\n\
             password: secret\n\
             buffer_read_timeout: 45s\n",
        )
        .unwrap();
        assert_eq!(config.base_url(), "https://micronova.agua-iot.com");
        assert_eq!(config.application_version, "1.9.7");
        assert_eq!(config.language, "ENG");
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.read_policy().timeout, Duration::from_secs(45));
        assert_eq!(config.quirks(), Quirks::default());
        assert!(config.login_api_url.is_none());
    }

    #[test]
    fn debug_hides_password() {
        let endpoint = Endpoint::find("nina").unwrap();
        let config = ClientConfig::from_endpoint(endpoint, "a@b.c", "hunter2", "uuid");
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("999999"));
    }

    #[test]
    fn branded_endpoint() {
        let superior = Endpoint::find("MySuperior").unwrap();
        assert_eq!(superior.brand_id, Some("2"));
        assert_eq!(superior.brand, Some("superior"));
        assert_eq!(superior.login_api_url, Some(PIAZZETTA_LOGIN));
        assert!(Endpoint::find("Unknown brand").is_none());
    }
}

//! Driver-side seams: the interfaces this library consumes from the
//! launcher, and the configuration it synthesizes for the remote driver.
//!
//! Spawning the driver process (classpath assembly, archive discovery) is
//! the launcher's job; the session only builds a [`DriverSpec`] and
//! connects to whatever [`DriverEndpoint`] the launcher reports back.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::{keys, ClientConfig};

/// Which interpreter the remote driver hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Spark,
    PySpark,
    SparkR,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Spark => "spark",
            SessionKind::PySpark => "pyspark",
            SessionKind::SparkR => "sparkr",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spark" => Ok(SessionKind::Spark),
            "pyspark" => Ok(SessionKind::PySpark),
            "sparkr" => Ok(SessionKind::SparkR),
            other => Err(format!("unknown session kind {other:?}")),
        }
    }
}

/// Environment variables forwarded verbatim to the launcher. Their names
/// are contracts with existing deployments.
pub mod env {
    pub const LIVY_HOME: &str = "LIVY_HOME";
    pub const SPARK_HOME: &str = "SPARK_HOME";
    pub const PYSPARK_ARCHIVES_PATH: &str = "PYSPARK_ARCHIVES_PATH";
    pub const SPARKR_ARCHIVES_PATH: &str = "SPARKR_ARCHIVES_PATH";
    pub const LIVY_REPL_JAVA_OPTS: &str = "LIVY_REPL_JAVA_OPTS";

    pub const ALL: &[&str] = &[
        LIVY_HOME,
        SPARK_HOME,
        PYSPARK_ARCHIVES_PATH,
        SPARKR_ARCHIVES_PATH,
        LIVY_REPL_JAVA_OPTS,
    ];
}

/// Where the launched driver listens for the RPC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverEndpoint {
    pub host: String,
    pub port: u16,
}

/// External collaborator that spawns the remote driver process.
pub trait DriverLauncher: Send + Sync {
    fn launch(&self, spec: &DriverSpec) -> std::io::Result<DriverEndpoint>;
}

/// Everything the launcher needs to start a driver for one session.
#[derive(Debug, Clone)]
pub struct DriverSpec {
    pub kind: SessionKind,
    pub proxy_user: Option<String>,
    /// Configuration handed to the driver process, keyed by the names in
    /// [`crate::config::keys`].
    pub conf: BTreeMap<String, String>,
    /// Pass-through environment, filtered to the variables in [`env::ALL`]
    /// that are set in this process.
    pub env: BTreeMap<String, String>,
}

impl DriverSpec {
    pub fn synthesize(
        config: &ClientConfig,
        kind: SessionKind,
        proxy_user: Option<&str>,
    ) -> DriverSpec {
        let mut conf = BTreeMap::new();
        conf.insert(keys::SESSION_KIND.to_string(), kind.as_str().to_string());
        conf.insert(
            keys::MAX_MESSAGE_SIZE.to_string(),
            config.max_message_size.to_string(),
        );
        conf.insert(
            keys::SASL_MECHANISMS.to_string(),
            config.sasl_mechanism.clone(),
        );
        conf.insert(
            keys::SASL_QOP.to_string(),
            config.sasl_qop.as_str().to_string(),
        );
        if let Some(jars) = &config.repl_jars {
            conf.insert(keys::REPL_JARS.to_string(), jars.clone());
        }
        if let Some(class_path) = &config.repl_driver_class_path {
            conf.insert(keys::REPL_DRIVER_CLASS_PATH.to_string(), class_path.clone());
        }
        if let Some(user) = proxy_user {
            conf.insert(keys::PROXY_USER.to_string(), user.to_string());
        }

        let env = env::ALL
            .iter()
            .filter_map(|var| std::env::var(var).ok().map(|v| (var.to_string(), v)))
            .collect();

        DriverSpec {
            kind,
            proxy_user: proxy_user.map(String::from),
            conf,
            env,
        }
    }
}

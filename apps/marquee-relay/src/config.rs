use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("MARQUEE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4617),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { port: 4617 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[timebox::timeout]
    fn default_port_matches_env_fallback() {
        assert_eq!(Config::default().port, 4617);
    }
}

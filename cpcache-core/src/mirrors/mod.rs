//! Mirror selection: the ordered list of upstream base URLs.

mod score;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::time;

use crate::config::{Config, MirrorSelectionMethod, MirrorsAutoConfig};
use crate::storage::MetadataDb;

/// Produces the ordered mirror list handed to downloads and redirects.
///
/// In `predefined` mode the configured list is rotated round-robin, one
/// step per call, spreading load across mirrors. In `auto` mode a
/// background task periodically scores the candidates by probe latency
/// and the survivors are served in ascending score order; the ranking is
/// persisted so a restarted daemon does not begin unranked.
#[derive(Clone)]
pub struct MirrorSelector {
    mode: Arc<Mode>,
}

enum Mode {
    Predefined {
        mirrors: Vec<String>,
        cursor: AtomicUsize,
    },
    Auto {
        candidates: Vec<String>,
        ranked: RwLock<Vec<String>>,
    },
}

impl MirrorSelector {
    /// Builds the selector for `config`, loading any persisted ranking
    /// and starting the re-scoring task in `auto` mode.
    ///
    /// # Errors
    /// Any error from building the probing HTTP client.
    pub async fn start(config: &Config, db: MetadataDb) -> Result<Self, reqwest::Error> {
        let candidates: Vec<String> = config.candidate_mirrors().collect();
        match config.mirror_selection_method {
            MirrorSelectionMethod::Predefined => Ok(Self {
                mode: Arc::new(Mode::Predefined {
                    mirrors: candidates,
                    cursor: AtomicUsize::new(0),
                }),
            }),
            MirrorSelectionMethod::Auto => {
                let options = config.mirrors_auto();
                let persisted = match db.mirror_scores().await {
                    Ok(scores) => scores,
                    Err(error) => {
                        tracing::warn!(%error, "could not load persisted mirror ranking");
                        Vec::new()
                    }
                };
                let ranked: Vec<String> = persisted
                    .into_iter()
                    .map(|(url, _)| url)
                    .filter(|url| candidates.contains(url))
                    .collect();
                let selector = Self {
                    mode: Arc::new(Mode::Auto {
                        candidates,
                        ranked: RwLock::new(ranked),
                    }),
                };
                selector.spawn_rescoring(options, db)?;
                Ok(selector)
            }
        }
    }

    /// The ordered mirror list for one request.
    pub fn get_all(&self) -> Vec<String> {
        match self.mode.as_ref() {
            Mode::Predefined { mirrors, cursor } => {
                if mirrors.is_empty() {
                    return Vec::new();
                }
                let start = cursor.fetch_add(1, Ordering::Relaxed) % mirrors.len();
                let mut rotated = Vec::with_capacity(mirrors.len());
                rotated.extend_from_slice(&mirrors[start..]);
                rotated.extend_from_slice(&mirrors[..start]);
                rotated
            }
            Mode::Auto { candidates, ranked } => {
                let ranked = ranked.read().unwrap();
                if ranked.is_empty() {
                    // No scoring round has succeeded yet.
                    candidates.clone()
                } else {
                    ranked.clone()
                }
            }
        }
    }

    /// The currently preferred mirror, used for redirects.
    pub fn first(&self) -> Option<String> {
        self.get_all().into_iter().next()
    }

    fn spawn_rescoring(
        &self,
        options: MirrorsAutoConfig,
        db: MetadataDb,
    ) -> Result<(), reqwest::Error> {
        let client = score::probe_client(options.probe_timeout(), None)?;
        let mode = Arc::clone(&self.mode);

        tokio::spawn(async move {
            loop {
                let Mode::Auto { candidates, ranked } = mode.as_ref() else {
                    return;
                };

                score::update_ip_support(&db, candidates, &options).await;
                let scores = score::rank_mirrors(&client, candidates, &options).await;
                if scores.is_empty() {
                    tracing::warn!(
                        "mirror scoring produced no usable mirrors; keeping previous ranking"
                    );
                } else {
                    if let Err(error) = db.replace_mirror_scores(&scores).await {
                        tracing::warn!(%error, "failed to persist mirror ranking");
                    }
                    let urls: Vec<String> = scores.into_iter().map(|(url, _)| url).collect();
                    tracing::info!(mirrors = urls.len(), "mirror ranking refreshed");
                    *ranked.write().unwrap() = urls;
                }

                time::sleep(options.test_interval()).await;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predefined_config(mirrors: &[&str]) -> Config {
        toml::from_str(&format!(
            r#"
            port = 0
            cache_directory = "/tmp/cpcache-test"
            mirrors_predefined = [{}]
            "#,
            mirrors
                .iter()
                .map(|m| format!("{m:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn predefined_rotates_round_robin() {
        let config = predefined_config(&["http://a.example", "http://b.example", "http://c.example"]);
        let db = MetadataDb::open_in_memory().await.unwrap();
        let selector = MirrorSelector::start(&config, db).await.unwrap();

        assert_eq!(
            selector.get_all(),
            vec!["http://a.example", "http://b.example", "http://c.example"]
        );
        assert_eq!(
            selector.get_all(),
            vec!["http://b.example", "http://c.example", "http://a.example"]
        );
        assert_eq!(
            selector.get_all(),
            vec!["http://c.example", "http://a.example", "http://b.example"]
        );
        assert_eq!(selector.first(), Some("http://a.example".to_string()));
    }

    #[tokio::test]
    async fn blacklisted_mirror_is_never_selected() {
        let mut config = predefined_config(&["http://a.example", "http://b.example"]);
        config.mirrors_blacklist = vec!["http://b.example".to_string()];
        let db = MetadataDb::open_in_memory().await.unwrap();
        let selector = MirrorSelector::start(&config, db).await.unwrap();

        assert_eq!(selector.get_all(), vec!["http://a.example"]);
        assert_eq!(selector.get_all(), vec!["http://a.example"]);
    }

    #[tokio::test]
    async fn auto_mode_serves_persisted_ranking_at_boot() {
        // Unroutable candidates keep the background scorer from finding
        // anything, so the persisted ranking stays in effect.
        let mut config =
            predefined_config(&["https://127.0.0.1:9/fast", "https://127.0.0.1:9/slow"]);
        config.mirror_selection_method = MirrorSelectionMethod::Auto;

        let db = MetadataDb::open_in_memory().await.unwrap();
        db.replace_mirror_scores(&[
            ("https://127.0.0.1:9/slow".to_string(), 2.0),
            ("https://127.0.0.1:9/fast".to_string(), 0.5),
        ])
        .await
        .unwrap();

        let selector = MirrorSelector::start(&config, db).await.unwrap();
        assert_eq!(
            selector.get_all(),
            vec!["https://127.0.0.1:9/fast", "https://127.0.0.1:9/slow"]
        );
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_candidates_when_unranked() {
        let mut config = predefined_config(&["https://127.0.0.1:9/one"]);
        config.mirror_selection_method = MirrorSelectionMethod::Auto;
        let db = MetadataDb::open_in_memory().await.unwrap();

        let selector = MirrorSelector::start(&config, db).await.unwrap();
        assert_eq!(selector.get_all(), vec!["https://127.0.0.1:9/one"]);
    }
}

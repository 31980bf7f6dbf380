//! Thin client for the external profile/leaderboard service plus a bounded
//! fire-and-forget reporter for the relay. The service is a plain CRUD
//! backend addressed with query strings; from the relay's point of view
//! every call is best effort and failures only get logged.

use tokio::sync::mpsc;

/// Computes the actions-per-minute value the service stores. The division
/// happens on the reporting side, the backend only keeps the final number.
pub fn apm_for(attacks: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    attacks as f64 / elapsed_secs * 60.0
}

/// Blocking-free HTTP client for the profile service.
pub struct ProfileClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProfileClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        ProfileClient {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Updates the amount of players currently connected to a room.
    pub async fn update_player_num(
        &self,
        room_addr: &str,
        player_num: usize,
    ) -> Result<(), String> {
        self.http
            .post(format!("{}/users/rooms/player-num", self.base_url))
            .query(&[
                ("room_addr", room_addr),
                ("player_num", &player_num.to_string()),
            ])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| format!("Failed to update player count: {}", e))?;
        Ok(())
    }

    /// Books a finished game onto the player's record.
    pub async fn add_game(&self, username: &str, win: bool) -> Result<(), String> {
        self.http
            .post(format!("{}/users/games", self.base_url))
            .query(&[("username", username), ("win", &win.to_string())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| format!("Failed to add game: {}", e))?;
        Ok(())
    }

    /// Updates the player's APM from the attack count and the match length.
    pub async fn update_apm(
        &self,
        username: &str,
        attacks: u64,
        elapsed_secs: f64,
    ) -> Result<(), String> {
        let apm = apm_for(attacks, elapsed_secs);
        self.http
            .post(format!("{}/users/apm", self.base_url))
            .query(&[("username", username), ("apm", &apm.to_string())])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| format!("Failed to update apm: {}", e))?;
        Ok(())
    }

    /// Amount of documents in the user store. Mainly useful for smoke tests
    /// against a live backend.
    pub async fn estimated_document_count(&self) -> Result<u64, String> {
        let text = self
            .http
            .get(format!("{}/users/len", self.base_url))
            .send()
            .await
            .map_err(|e| format!("Failed to query document count: {}", e))?
            .text()
            .await
            .map_err(|e| format!("Failed to read document count: {}", e))?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| format!("Malformed document count '{}': {}", text, e))
    }
}

/// One queued report for the drain task.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEvent {
    PlayerCount {
        room_addr: String,
        player_num: usize,
    },
    GameResult {
        username: String,
        won: bool,
    },
    Apm {
        username: String,
        attacks: u64,
        elapsed_secs: f64,
    },
}

/// Fire-and-forget front of the profile client. Reports go through a
/// bounded queue drained by a single task, so a slow or dead profile
/// service can never block the relay or pile up one task per event.
pub struct ProfileReporter {
    queue: mpsc::Sender<ProfileEvent>,
}

impl ProfileReporter {
    /// Spawns the drain task and hands back the enqueueing side.
    pub fn spawn(client: ProfileClient, queue_depth: usize) -> Self {
        let (queue, mut pending) = mpsc::channel(queue_depth);
        tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                let result = match &event {
                    ProfileEvent::PlayerCount {
                        room_addr,
                        player_num,
                    } => client.update_player_num(room_addr, *player_num).await,
                    ProfileEvent::GameResult { username, won } => {
                        client.add_game(username, *won).await
                    }
                    ProfileEvent::Apm {
                        username,
                        attacks,
                        elapsed_secs,
                    } => client.update_apm(username, *attacks, *elapsed_secs).await,
                };
                // Best effort only, the relay never retries (see the error
                // handling design): log and move on.
                if let Err(message) = result {
                    tracing::warn!(error = %message, ?event, "Profile service call failed.");
                }
            }
        });
        ProfileReporter { queue }
    }

    /// Enqueues a report. A full queue drops the event with a warning
    /// instead of applying backpressure to the caller.
    pub fn report(&self, event: ProfileEvent) {
        if let Err(err) = self.queue.try_send(event) {
            tracing::warn!(?err, "Profile report queue full, dropping event.");
        }
    }

    pub fn player_count(&self, room_addr: &str, player_num: usize) {
        self.report(ProfileEvent::PlayerCount {
            room_addr: room_addr.to_string(),
            player_num,
        });
    }

    pub fn game_result(&self, username: &str, won: bool) {
        self.report(ProfileEvent::GameResult {
            username: username.to_string(),
            won,
        });
    }

    pub fn apm(&self, username: &str, attacks: u64, elapsed_secs: f64) {
        self.report(ProfileEvent::Apm {
            username: username.to_string(),
            attacks,
            elapsed_secs,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apm_is_attacks_per_minute() {
        assert_eq!(apm_for(30, 60.0), 30.0);
        assert_eq!(apm_for(10, 120.0), 5.0);
    }

    #[test]
    fn apm_survives_zero_elapsed_time() {
        assert_eq!(apm_for(5, 0.0), 0.0);
    }
}

//! Resolve one candidate record to its best catalog track.
//!
//! ## Query plan
//!
//! For every artist variant ([`split_artists`]) and every title variant
//! ([`title_variants`]), three searches are tried in order:
//!
//! 1. `track:"T" artist:"A"`
//! 2. `track:T artist:A`
//! 3. `A T`
//!
//! Duplicate query strings are dropped. Each search goes through
//! [`call_with_retry`], so a rate-limited query is retried before the plan
//! moves on. The first query whose results contain an accepted track wins.
//!
//! ## Acceptance
//!
//! Rules are checked in order and the first one satisfied classifies a track:
//!
//! | Rule | Artist | Title |
//! |------|--------|-------|
//! | [`AcceptRule::BothStrong`] | ≥ 80 | ≥ 80 |
//! | [`AcceptRule::ArtistExact`] | ≥ 95 | ≥ 65 and (titles overlap, or substituted title ≥ 85) |
//! | [`AcceptRule::TitleExact`] | ≥ 70 | ≥ 95 |
//!
//! Within one result set the track with the earliest rule wins; ties go to
//! the higher mean score.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogTrack};
use crate::error::RemoteError;
use crate::memo::MatchMemo;
use crate::models::{CandidateRecord, ResolvedMatch};
use crate::retry::{call_with_retry, RetryPolicy, Sleeper, TokioSleeper};
use crate::similarity::{
    similarity, split_artists, substituted_similarity, title_variants, titles_overlap,
};

pub const BOTH_STRONG_MIN: f64 = 80.0;
pub const ARTIST_EXACT_MIN: f64 = 95.0;
pub const ARTIST_EXACT_TITLE_MIN: f64 = 65.0;
pub const ARTIST_EXACT_SUBSTITUTED_MIN: f64 = 85.0;
pub const TITLE_EXACT_MIN: f64 = 95.0;
pub const TITLE_EXACT_ARTIST_MIN: f64 = 70.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    /// Artist variant the query was built from; scoring compares against it.
    pub artist: String,
}

/// Build the ordered, de-duplicated query plan for a candidate.
pub fn build_queries(candidate: &CandidateRecord) -> Vec<SearchQuery> {
    let mut queries: Vec<SearchQuery> = Vec::new();
    let titles = title_variants(&candidate.title);
    for artist in split_artists(&candidate.artist) {
        for title in &titles {
            let (qa, qt) = (artist.replace('"', ""), title.replace('"', ""));
            for text in [
                format!("track:\"{}\" artist:\"{}\"", qt, qa),
                format!("track:{} artist:{}", title, artist),
                format!("{} {}", artist, title),
            ] {
                if !queries.iter().any(|q| q.text == text) {
                    queries.push(SearchQuery {
                        text,
                        artist: artist.clone(),
                    });
                }
            }
        }
    }
    queries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AcceptRule {
    BothStrong,
    ArtistExact,
    TitleExact,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackScore {
    pub artist_score: f64,
    pub title_score: f64,
    pub substituted_title_score: f64,
    pub titles_overlap: bool,
    /// The listed artist that produced `artist_score`.
    pub matched_artist: String,
}

impl TrackScore {
    pub fn average(&self) -> f64 {
        (self.artist_score + self.title_score) / 2.0
    }
}

/// Score a catalog track against a query artist and the candidate title.
pub fn score_track(query_artist: &str, title: &str, track: &CatalogTrack) -> TrackScore {
    let mut artist_score = 0.0;
    let mut matched_artist = String::new();
    for listed in &track.artists {
        let s = similarity(query_artist, listed);
        if s > artist_score || matched_artist.is_empty() {
            artist_score = s;
            matched_artist = listed.clone();
        }
    }

    let raw = similarity(title, &track.name);
    let substituted = substituted_similarity(title, &track.name);

    TrackScore {
        artist_score,
        title_score: raw.max(substituted),
        substituted_title_score: substituted,
        titles_overlap: titles_overlap(title, &track.name),
        matched_artist,
    }
}

/// The first acceptance rule `score` satisfies, if any.
pub fn accept(score: &TrackScore) -> Option<AcceptRule> {
    if score.artist_score >= BOTH_STRONG_MIN && score.title_score >= BOTH_STRONG_MIN {
        return Some(AcceptRule::BothStrong);
    }
    if score.artist_score >= ARTIST_EXACT_MIN
        && score.title_score >= ARTIST_EXACT_TITLE_MIN
        && (score.titles_overlap || score.substituted_title_score >= ARTIST_EXACT_SUBSTITUTED_MIN)
    {
        return Some(AcceptRule::ArtistExact);
    }
    if score.title_score >= TITLE_EXACT_MIN && score.artist_score >= TITLE_EXACT_ARTIST_MIN {
        return Some(AcceptRule::TitleExact);
    }
    None
}

/// Pick the accepted track from one result set.
pub fn best_match(
    candidate: &CandidateRecord,
    query_artist: &str,
    tracks: &[CatalogTrack],
) -> Option<ResolvedMatch> {
    let mut best: Option<(AcceptRule, TrackScore, &CatalogTrack)> = None;
    for track in tracks {
        let score = score_track(query_artist, &candidate.title, track);
        let Some(rule) = accept(&score) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((best_rule, best_score, _)) => {
                rule < *best_rule || (rule == *best_rule && score.average() > best_score.average())
            }
        };
        if better {
            best = Some((rule, score, track));
        }
    }

    best.map(|(rule, score, track)| {
        debug!(
            rule = ?rule,
            artist_score = score.artist_score,
            title_score = score.title_score,
            uri = %track.uri,
            "accepted track"
        );
        ResolvedMatch {
            candidate: candidate.clone(),
            external_id: track.uri.clone(),
            artist_score: score.artist_score,
            title_score: score.title_score,
            matched_artist: score.matched_artist,
            matched_title: track.name.clone(),
        }
    })
}

/// Resolves candidates through a [`Catalog`], memoizing accepted matches.
pub struct MatchScorer {
    memo: Arc<MatchMemo>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    search_limit: usize,
}

impl MatchScorer {
    pub fn new(memo: Arc<MatchMemo>, policy: RetryPolicy) -> Self {
        Self {
            memo,
            policy,
            sleeper: Arc::new(TokioSleeper),
            search_limit: 10,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    pub fn memo(&self) -> &Arc<MatchMemo> {
        &self.memo
    }

    /// Resolve `candidate`, or `Ok(None)` when no query yields an accepted track.
    ///
    /// Authentication failures are returned immediately. Other failed
    /// searches are skipped; if every search failed, the last error is
    /// returned instead of `None`.
    pub async fn resolve(
        &self,
        candidate: &CandidateRecord,
        catalog: &dyn Catalog,
    ) -> Result<Option<ResolvedMatch>, RemoteError> {
        let signature = candidate.signature();
        if let Some(hit) = self.memo.get(&signature) {
            debug!(signature = %signature, "memo hit");
            return Ok(Some(ResolvedMatch {
                candidate: candidate.clone(),
                ..hit
            }));
        }

        if candidate.title.trim().is_empty() || candidate.artist.trim().is_empty() {
            warn!(signature = %signature, "candidate missing artist or title, skipping");
            return Ok(None);
        }

        let queries = build_queries(candidate);
        let mut last_err = None;
        let mut any_succeeded = false;

        for query in &queries {
            let label = format!("search {}", query.text);
            let result = call_with_retry(&self.policy, self.sleeper.as_ref(), &label, || {
                catalog.search_tracks(&query.text, self.search_limit)
            })
            .await;

            match result {
                Ok(tracks) => {
                    any_succeeded = true;
                    if let Some(resolved) = best_match(candidate, &query.artist, &tracks) {
                        info!(
                            artist = %candidate.artist,
                            title = %candidate.title,
                            uri = %resolved.external_id,
                            query = %query.text,
                            "resolved candidate"
                        );
                        self.memo.insert(signature, resolved.clone());
                        return Ok(Some(resolved));
                    }
                }
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    warn!(query = %query.text, error = %e, "search failed, trying next variant");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if !any_succeeded => Err(e),
            _ => {
                info!(
                    artist = %candidate.artist,
                    title = %candidate.title,
                    queries = queries.len(),
                    "no acceptable match"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(uri: &str, artists: &[&str], name: &str) -> CatalogTrack {
        CatalogTrack {
            id: uri.rsplit(':').next().unwrap_or(uri).to_string(),
            uri: uri.to_string(),
            name: name.to_string(),
            artists: artists.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn score(artist: f64, title: f64, substituted: f64, overlap: bool) -> TrackScore {
        TrackScore {
            artist_score: artist,
            title_score: title,
            substituted_title_score: substituted,
            titles_overlap: overlap,
            matched_artist: String::new(),
        }
    }

    #[test]
    fn query_plan_order() {
        let c = CandidateRecord::new("Bladee", "Be Nice 2 Me");
        let q: Vec<String> = build_queries(&c).into_iter().map(|q| q.text).collect();
        assert_eq!(
            q,
            vec![
                "track:\"Be Nice 2 Me\" artist:\"Bladee\"",
                "track:Be Nice 2 Me artist:Bladee",
                "Bladee Be Nice 2 Me",
                "track:\"Be Nice to Me\" artist:\"Bladee\"",
                "track:Be Nice to Me artist:Bladee",
                "Bladee Be Nice to Me",
            ]
        );
    }

    #[test]
    fn query_plan_covers_featured_artists() {
        let c = CandidateRecord::new("Drake ft. Future", "Jumpman");
        let plan = build_queries(&c);
        let artists: Vec<&str> = plan.iter().map(|q| q.artist.as_str()).collect();
        assert_eq!(&artists[0..3], &["Drake", "Drake", "Drake"]);
        assert_eq!(&artists[3..6], &["Future", "Future", "Future"]);
        assert_eq!(&artists[6..9], &["Drake ft. Future"; 3]);
    }

    #[test]
    fn rule_order() {
        assert_eq!(accept(&score(80.0, 80.0, 0.0, false)), Some(AcceptRule::BothStrong));
        assert_eq!(accept(&score(95.0, 65.0, 0.0, true)), Some(AcceptRule::ArtistExact));
        assert_eq!(accept(&score(95.0, 65.0, 85.0, false)), Some(AcceptRule::ArtistExact));
        assert_eq!(accept(&score(95.0, 65.0, 84.0, false)), None);
        assert_eq!(accept(&score(95.0, 64.0, 100.0, true)), None);
        assert_eq!(accept(&score(70.0, 95.0, 0.0, false)), Some(AcceptRule::TitleExact));
        assert_eq!(accept(&score(69.0, 95.0, 0.0, false)), None);
        assert_eq!(accept(&score(79.0, 79.0, 79.0, true)), None);
    }

    #[test]
    fn shorthand_title_matches() {
        let c = CandidateRecord::new("Bladee", "Be Nice 2 Me");
        let tracks = vec![track("cat:track:1", &["Bladee"], "Be Nice To Me")];
        let m = best_match(&c, "Bladee", &tracks).expect("should match");
        assert_eq!(m.external_id, "cat:track:1");
        assert_eq!(m.artist_score, 100.0);
        assert_eq!(m.title_score, 100.0);
        assert_eq!(m.matched_title, "Be Nice To Me");
    }

    #[test]
    fn different_labels_do_not_match() {
        let c = CandidateRecord::new("Artist A", "Song X");
        let tracks = vec![track("cat:track:2", &["Artist B"], "Song Y")];
        assert!(best_match(&c, "Artist A", &tracks).is_none());
    }

    #[test]
    fn substring_rule_accepts_decorated_titles() {
        let c = CandidateRecord::new("Beyoncé", "Crazy in Love");
        let tracks = vec![track("cat:track:3", &["Beyoncé"], "Crazy in Love - Live")];
        let m = best_match(&c, "Beyoncé", &tracks).expect("artist-exact rule");
        assert_eq!(m.external_id, "cat:track:3");
        assert!(m.title_score < BOTH_STRONG_MIN);
    }

    #[test]
    fn earliest_rule_then_average_wins() {
        let c = CandidateRecord::new("Beyoncé", "Crazy in Love");
        let tracks = vec![
            track("cat:track:live", &["Beyoncé"], "Crazy in Love - Live"),
            track("cat:track:studio", &["Beyoncé"], "Crazy in Love"),
            track("cat:track:cover", &["Beyonce Tribute"], "Crazy in Love"),
        ];
        let m = best_match(&c, "Beyoncé", &tracks).unwrap();
        assert_eq!(m.external_id, "cat:track:studio");
    }

    #[test]
    fn artist_score_takes_best_listed_artist() {
        let t = track("cat:track:4", &["Rihanna", "Drake"], "Work");
        let s = score_track("Drake", "Work", &t);
        assert_eq!(s.artist_score, 100.0);
        assert_eq!(s.matched_artist, "Drake");
    }

    #[test]
    fn typo_in_artist_still_matches() {
        let c = CandidateRecord::new("Fleetwod Mac", "Dreams");
        let tracks = vec![track("cat:track:5", &["Fleetwood Mac"], "Dreams")];
        let m = best_match(&c, "Fleetwod Mac", &tracks).unwrap();
        assert!(m.artist_score >= 95.0);
    }

    #[test]
    fn empty_results_resolve_to_none() {
        let c = CandidateRecord::new("X", "Y");
        assert!(best_match(&c, "X", &[]).is_none());
    }
}

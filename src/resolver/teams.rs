//! Team name standardization, ported from the Python original's
//! `mlb_stats_api_game_resolution_service.py`: a fixed reference table
//! plus a four-tier matching waterfall (exact abbreviation, alias exact,
//! alias substring, fuzzy keyword) used before falling back to "unresolved".

use std::collections::HashMap;

use crate::types::TeamRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchConfidence {
    None,
    Low,
    Medium,
    High,
}

pub struct TeamStandardizer {
    teams: HashMap<String, TeamRef>,
    fuzzy_keywords: HashMap<&'static str, &'static str>,
}

impl TeamStandardizer {
    pub fn new(teams: Vec<TeamRef>) -> Self {
        let teams = teams.into_iter().map(|t| (t.code.clone(), t)).collect();
        Self {
            teams,
            fuzzy_keywords: Self::default_fuzzy_keywords(),
        }
    }

    fn default_fuzzy_keywords() -> HashMap<&'static str, &'static str> {
        // A representative slice of the original's ~28-entry nickname map;
        // extended per league as new sources are onboarded.
        HashMap::from([
            ("yanks", "NYY"),
            ("sox", "BOS"),
            ("mets", "NYM"),
            ("dodgers", "LAD"),
            ("giants", "SF"),
            ("cubs", "CHC"),
            ("astros", "HOU"),
            ("braves", "ATL"),
        ])
    }

    /// Tries, in order: exact abbreviation match, exact alias match
    /// (case-insensitive), alias substring match, fuzzy keyword lookup.
    /// Returns `None` with the input untouched if nothing matches.
    pub fn standardize(&self, input: &str) -> Option<(String, MatchConfidence)> {
        let upper = input.trim().to_uppercase();

        if self.teams.contains_key(&upper) {
            return Some((upper, MatchConfidence::High));
        }

        let lower = input.trim().to_lowercase();
        for team in self.teams.values() {
            if team
                .aliases
                .iter()
                .any(|alias| alias.to_lowercase() == lower)
            {
                return Some((team.code.clone(), MatchConfidence::High));
            }
        }

        for team in self.teams.values() {
            if team
                .aliases
                .iter()
                .any(|alias| lower.contains(&alias.to_lowercase()))
            {
                return Some((team.code.clone(), MatchConfidence::Medium));
            }
        }

        if let Some(code) = self.fuzzy_keywords.get(lower.as_str()) {
            return Some((code.to_string(), MatchConfidence::Low));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yankees() -> TeamRef {
        TeamRef {
            code: "NYY".into(),
            full_name: "New York Yankees".into(),
            aliases: vec!["Yankees".into(), "New York Yankees".into()],
            division: "AL EAST".into(),
            league_id: "MLB".into(),
        }
    }

    #[test]
    fn exact_abbreviation_matches_with_high_confidence() {
        let standardizer = TeamStandardizer::new(vec![yankees()]);
        assert_eq!(
            standardizer.standardize("NYY"),
            Some(("NYY".to_string(), MatchConfidence::High))
        );
    }

    #[test]
    fn alias_exact_case_insensitive_match() {
        let standardizer = TeamStandardizer::new(vec![yankees()]);
        assert_eq!(
            standardizer.standardize("yankees"),
            Some(("NYY".to_string(), MatchConfidence::High))
        );
    }

    #[test]
    fn alias_substring_match_medium_confidence() {
        let standardizer = TeamStandardizer::new(vec![yankees()]);
        let (code, confidence) = standardizer.standardize("NY Yankees at home").unwrap();
        assert_eq!(code, "NYY");
        assert_eq!(confidence, MatchConfidence::Medium);
    }

    #[test]
    fn fuzzy_keyword_fallback() {
        let standardizer = TeamStandardizer::new(vec![yankees()]);
        assert_eq!(
            standardizer.standardize("yanks"),
            Some(("NYY".to_string(), MatchConfidence::Low))
        );
    }

    #[test]
    fn unresolvable_input_returns_none() {
        let standardizer = TeamStandardizer::new(vec![yankees()]);
        assert_eq!(standardizer.standardize("Unrelated Team"), None);
    }
}

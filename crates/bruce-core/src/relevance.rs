//! Scores completed tasks by how useful they are as background for another task.

use std::collections::BTreeSet;

use regex::Regex;

use crate::task::Task;

pub const SAME_PHASE_SCORE: u32 = 10;
pub const KEYWORD_SCORE: u32 = 2;
pub const DIRECT_DEPENDENCY_SCORE: u32 = 15;
pub const SHARED_DEPENDENCY_SCORE: u32 = 3;
pub const DEFAULT_LIMIT: usize = 5;

const STOP_WORDS: [&str; 11] = [
    "the", "a", "an", "and", "or", "for", "to", "in", "of", "with", "from",
];

#[derive(Debug, Clone)]
pub struct ScoredTask<'a> {
    pub task: &'a Task,
    pub score: u32,
}

/// Lowercased word tokens of `text` minus stop words.
pub fn keywords(text: &str) -> BTreeSet<String> {
    let re = Regex::new(r"\w+").expect("regex");
    re.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|word| !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

pub fn score(target: &Task, candidate: &Task) -> u32 {
    let mut score = 0;
    if candidate.phase == target.phase {
        score += SAME_PHASE_SCORE;
    }
    let target_words = keywords(&target.description);
    let candidate_words = keywords(&candidate.description);
    score += KEYWORD_SCORE * target_words.intersection(&candidate_words).count() as u32;
    if target.depends_on.iter().any(|dep| *dep == candidate.id) {
        score += DIRECT_DEPENDENCY_SCORE;
    }
    let target_deps: BTreeSet<&str> = target.depends_on.iter().map(String::as_str).collect();
    let shared = candidate
        .depends_on
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>()
        .intersection(&target_deps)
        .count() as u32;
    score += SHARED_DEPENDENCY_SCORE * shared;
    score
}

/// Completed tasks other than the target with a positive score, best first.
///
/// Ties keep the order of `tasks`.
pub fn score_candidates<'a>(tasks: &'a [Task], target: &Task) -> Vec<ScoredTask<'a>> {
    let mut scored: Vec<ScoredTask<'a>> = tasks
        .iter()
        .filter(|task| task.id != target.id && task.is_completed())
        .map(|task| ScoredTask {
            task,
            score: score(target, task),
        })
        .filter(|scored| scored.score > 0)
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored
}

/// Up to `limit` related tasks for `target_id`. Unknown ids yield nothing.
pub fn find_related<'a>(tasks: &'a [Task], target_id: &str, limit: usize) -> Vec<&'a Task> {
    let Some(target) = tasks.iter().find(|task| task.id == target_id) else {
        return Vec::new();
    };
    score_candidates(tasks, target)
        .into_iter()
        .take(limit)
        .map(|scored| scored.task)
        .collect()
}

//! Loop-break escalation: when the policy repeats the same `(action,
//! selector)` pair, try a different click strategy rather than looping
//! forever on one that isn't working.

use core_types::{Action, ActionKind, ClickMethod};

/// A submit-like selector: its visible text hints at a button meant to
/// advance the page, not just react to a click.
fn looks_like_submit(selector: &str) -> bool {
    let lower = selector.to_ascii_lowercase();
    ["btn", "submit", "search"].iter().any(|needle| lower.contains(needle))
}

#[derive(Default)]
pub struct RepeatTracker {
    history: Vec<(ActionKind, String)>,
}

impl RepeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutates `action` in place according to how many times in a row the
    /// same `(kind, selector)` pair has just been attempted, then records
    /// this attempt for the next call.
    pub fn apply_and_record(&mut self, action: &mut Action) {
        let key = (action.kind.clone(), action.selector_text().to_string());
        let run_length = self.current_run_length(&key) + 1;

        if action.kind == ActionKind::Click {
            if run_length == 2 {
                action.click_method = Some(ClickMethod::Js);
            } else if run_length >= 3 && looks_like_submit(&key.1) {
                action.kind = ActionKind::Submit;
            }
        }

        self.history.push(key);
    }

    fn current_run_length(&self, key: &(ActionKind, String)) -> u32 {
        let mut run = 0;
        for entry in self.history.iter().rev() {
            if entry == key {
                run += 1;
            } else {
                break;
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_consecutive_click_switches_to_js() {
        let mut tracker = RepeatTracker::new();
        let mut first = Action::new(ActionKind::Click);
        first.selector = Some("#go".into());
        tracker.apply_and_record(&mut first);
        assert_eq!(first.click_method, None);

        let mut second = Action::new(ActionKind::Click);
        second.selector = Some("#go".into());
        tracker.apply_and_record(&mut second);
        assert_eq!(second.click_method, Some(ClickMethod::Js));
    }

    #[test]
    fn third_consecutive_click_on_submit_like_selector_becomes_submit() {
        let mut tracker = RepeatTracker::new();
        for _ in 0..2 {
            let mut action = Action::new(ActionKind::Click);
            action.selector = Some("button.btn-search".into());
            tracker.apply_and_record(&mut action);
        }

        let mut third = Action::new(ActionKind::Click);
        third.selector = Some("button.btn-search".into());
        tracker.apply_and_record(&mut third);
        assert_eq!(third.kind, ActionKind::Submit);
    }

    #[test]
    fn different_selector_resets_the_run() {
        let mut tracker = RepeatTracker::new();
        let mut first = Action::new(ActionKind::Click);
        first.selector = Some("#a".into());
        tracker.apply_and_record(&mut first);

        let mut second = Action::new(ActionKind::Click);
        second.selector = Some("#b".into());
        tracker.apply_and_record(&mut second);
        assert_eq!(second.click_method, None);
    }
}

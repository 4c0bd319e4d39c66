//! Script pieces shared by the file, folder and link clients.
//!
//! Scripts bind the managed path as `$path`, the rename destination as
//! `$dest` and the attributes as `$mode`, `$owner` and `$group`.

use camino::Utf8Path;

use crate::protocol::Script;
use crate::protocol::Sentinel;
use crate::protocol::Step;

pub(crate) fn absent(var: &str) -> String {
    format!(r#"[ ! -e "${var}" ] && [ ! -L "${var}" ]"#)
}

pub(crate) fn regular(var: &str) -> String {
    format!(r#"[ -f "${var}" ] && [ ! -L "${var}" ]"#)
}

pub(crate) fn directory(var: &str) -> String {
    format!(r#"[ -d "${var}" ] && [ ! -L "${var}" ]"#)
}

pub(crate) fn symlink(var: &str) -> String {
    format!(r#"[ -L "${var}" ]"#)
}

/// Permission bits and ownership to apply. Unset fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Attributes<'a> {
    pub mode: Option<u32>,
    pub owner: Option<&'a str>,
    pub group: Option<&'a str>,
    /// Change the link itself rather than what it points to.
    pub no_dereference: bool,
}

impl Attributes<'_> {
    pub(crate) fn bind(&self, mut script: Script) -> Script {
        if let Some(mode) = self.mode {
            script = script.param("mode", format_args!("{mode:o}"));
        }
        if let Some(owner) = self.owner {
            script = script.param("owner", owner);
        }
        if let Some(group) = self.group {
            script = script.param("group", group);
        }
        script
    }

    /// Steps applying the set attributes to `$var`. With `revert`, each step
    /// records the current value first so it can be restored.
    pub(crate) fn steps(&self, var: &str, revert: bool) -> Vec<Step> {
        let h = if self.no_dereference { "-h " } else { "" };
        let revertible = |step: Step, name: &str, current: String, undo: String| {
            if revert {
                step.capture(name, current).undo(undo)
            } else {
                step
            }
        };

        let mut steps = Vec::new();
        if self.mode.is_some() {
            steps.push(revertible(
                Step::run(format!(r#"chmod -- "$mode" "${var}""#)),
                "old_mode",
                format!(r#"stat -c %a -- "${var}""#),
                format!(r#"chmod -- "$_old_mode" "${var}""#),
            ));
        }
        if self.owner.is_some() {
            steps.push(revertible(
                Step::run(format!(r#"chown {h}-- "$owner" "${var}""#)),
                "old_owner",
                format!(r#"stat -c %u -- "${var}""#),
                format!(r#"chown {h}-- "$_old_owner" "${var}""#),
            ));
        }
        if self.group.is_some() {
            steps.push(revertible(
                Step::run(format!(r#"chgrp {h}-- "$group" "${var}""#)),
                "old_group",
                format!(r#"stat -c %g -- "${var}""#),
                format!(r#"chgrp {h}-- "$_old_group" "${var}""#),
            ));
        }
        steps
    }
}

/// Adds a rename of `$path` to `dest`, failing with `taken` when the
/// destination exists. Returns the variable naming the final path.
pub(crate) fn rename<S: Sentinel>(
    script: Script,
    dest: Option<&Utf8Path>,
    taken: S,
) -> (Script, &'static str) {
    let Some(dest) = dest else {
        return (script, "path");
    };
    let script = script
        .param("dest", dest)
        .check(absent("dest"), taken)
        .step(Step::run(r#"mv -- "$path" "$dest""#).undo(r#"mv -- "$dest" "$path""#));
    (script, "dest")
}

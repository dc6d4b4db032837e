//! Child environment builder.

use taskrun_core::settings::RunnerSettings;

use crate::task::Recipe;

/// Materialize the `NAME=value` vector handed to the child of
/// `recipe.tasks[idx]`.
///
/// Order matters: the child resolves duplicates by standard POSIX lookup, so
/// later entries win. No uniqueness is enforced here.
pub(crate) fn build_env(recipe: &Recipe, idx: usize, settings: &RunnerSettings) -> Vec<String> {
    let task = &recipe.tasks[idx];
    let prefix = if task.rhts_compat {
        ""
    } else {
        settings.env_prefix.as_str()
    };

    let mut env = Vec::new();
    for role in &recipe.roles {
        env.push(format!("{}={}", role.name, role.value));
    }
    for role in &task.roles {
        env.push(format!("{}={}", role.name, role.value));
    }
    env.push(format!("{prefix}JOBID={}", recipe.job_id));
    env.push(format!("{prefix}RECIPESETID={}", recipe.recipe_set_id));
    env.push(format!("{prefix}RECIPEID={}", recipe.recipe_id));
    env.push(format!("{prefix}TASKID={}", task.task_id));
    env.push(format!("{prefix}OSDISTRO={}", recipe.osdistro));
    env.push(format!("{prefix}OSMAJOR={}", recipe.osmajor));
    env.push(format!("{prefix}OSVARIANT={}", recipe.osvariant));
    env.push(format!("{prefix}OSARCH={}", recipe.osarch));
    env.push(format!("{prefix}TASKPATH={}", task.path.display()));
    env.push(format!("{prefix}TASKNAME={}", task.name));
    env.push(format!("{prefix}MAXTIME={}", task.max_time));
    env.push(format!("{prefix}LAB_CONTROLLER="));
    env.push(format!("{prefix}TASKORDER={}", task.order));
    // HOME, TERM and LANG can be overridden by recipe or task params.
    env.push("HOME=/root".to_string());
    env.push("TERM=vt100".to_string());
    env.push("LANG=en_US.UTF-8".to_string());
    env.push("PATH=/usr/local/bin:usr/bin:/bin:/usr/local/sbin:/usr/sbin".to_string());
    for param in &recipe.params {
        env.push(format!("{}={}", param.name, param.value));
    }
    for param in &task.params {
        env.push(format!("{}={}", param.name, param.value));
    }
    env
}

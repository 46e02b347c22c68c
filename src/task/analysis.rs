use super::{DependencyGraph, FETCH_TOKEN_TASK, Task, TaskAction, TaskRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOrigin {
    Declared,
    Aggregate,
    Token,
}

pub fn edge_origin(task: &Task, dependency: &str) -> EdgeOrigin {
    if task.dependencies.iter().any(|dep| dep == dependency) {
        return EdgeOrigin::Declared;
    }

    if matches!(task.action, TaskAction::Aggregate(_)) {
        return EdgeOrigin::Aggregate;
    }

    if dependency == FETCH_TOKEN_TASK && task.action.is_network() {
        return EdgeOrigin::Token;
    }

    EdgeOrigin::Declared
}

pub fn show_task_relationships(registry: &TaskRegistry, graph: &DependencyGraph, verbose: bool) {
    if !verbose {
        return;
    }

    for task in registry.iter() {
        for dep_id in graph.dependencies(&task.name) {
            match edge_origin(task, dep_id) {
                EdgeOrigin::Declared => {}
                EdgeOrigin::Aggregate => {
                    println!("Info: Aggregate '{}' includes '{}'", task.name, dep_id);
                }
                EdgeOrigin::Token => {
                    println!(
                        "Info: Task '{}' depends on '{}' for authentication",
                        task.name, dep_id
                    );
                }
            }
        }
    }
}

pub fn print_task_list(registry: &TaskRegistry) {
    for (group, tasks) in registry.groups() {
        println!("{}", group);
        println!("{}", "-".repeat(group.len()));

        let width = tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);
        for task in tasks {
            match &task.description {
                Some(description) => {
                    println!("{:<width$} - {}", task.name, description, width = width)
                }
                None => println!("{}", task.name),
            }
        }
        println!();
    }
}

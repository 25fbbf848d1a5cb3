use std::sync::Arc;

use rollcall_core::models::Group;
use rollcall_core::EntityId;

use crate::commands::common::{format_group_lines, print_finish, GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

/// Membership and flag edits on an existing group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEdit {
    AddMember(EntityId),
    RemoveMember(EntityId),
    SetLeader(Option<EntityId>),
    Flag(bool),
}

pub async fn run_groups_list(options: &GlobalOptions, as_json: bool) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    let mut groups = session.engine.cache().groups();
    groups.sort_by(|left, right| left.name.cmp(&right.name));

    if as_json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
    } else if groups.is_empty() {
        println!("No groups created.");
    } else {
        let users = session.engine.cache().users();
        for line in format_group_lines(&groups, &users) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_groups_add(
    options: &GlobalOptions,
    name: String,
    capacity: u32,
) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    let group = session.engine.create_group(Group::new(name, capacity)).await?;
    println!("{}", group.id);
    print_finish(session.finish().await);
    Ok(())
}

pub async fn run_groups_generate(options: &GlobalOptions, size: u32) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    let created = session.engine.generate_groups(size).await?;
    for group in &created {
        println!("{}  {}", group.id, group.name);
    }
    println!("{} group(s) created", created.len());
    print_finish(session.finish().await);
    Ok(())
}

pub async fn run_groups_auto_assign(options: &GlobalOptions) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    let assigned = session.engine.auto_assign().await?;
    let unassigned = session.engine.cache().users().len().saturating_sub(assigned);
    println!("Assigned {assigned} user(s)");
    if unassigned > 0 {
        println!("{unassigned} user(s) left without a group; every group is full");
    }
    print_finish(session.finish().await);
    Ok(())
}

pub async fn run_groups_delete(options: &GlobalOptions, id: EntityId) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    session.engine.delete_group(id).await?;
    println!("Deleted group {id}");
    print_finish(session.finish().await);
    Ok(())
}

pub async fn run_groups_edit(
    options: &GlobalOptions,
    group: EntityId,
    edit: GroupEdit,
) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    apply_group_edit(&session, group, edit).await?;
    print_finish(session.finish().await);
    Ok(())
}

pub async fn apply_group_edit(
    session: &Session,
    group: EntityId,
    edit: GroupEdit,
) -> Result<(), CliError> {
    let engine = &session.engine;
    match edit {
        GroupEdit::AddMember(user) => engine.add_member(group, user).await?,
        GroupEdit::RemoveMember(user) => engine.remove_member(group, user).await?,
        GroupEdit::SetLeader(leader) => engine.set_leader(group, leader).await?,
        GroupEdit::Flag(flagged) => engine.set_group_flagged(group, flagged).await?,
    }
    Ok(())
}

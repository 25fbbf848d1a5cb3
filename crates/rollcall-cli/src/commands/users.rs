use std::sync::Arc;

use rollcall_core::models::User;
use rollcall_core::EntityId;

use crate::commands::common::{format_user_lines, print_finish, GlobalOptions, Session};
use crate::error::CliError;
use crate::observer::ConsoleObserver;

/// Fields accepted by `rollcall users add`
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    pub registration_number: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub group: Option<EntityId>,
}

impl NewUser {
    pub fn into_user(self) -> User {
        let mut user = User::new(self.name, self.registration_number);
        user.email = self.email;
        user.phone_number = self.phone;
        user.group_id = self.group;
        user
    }
}

pub async fn run_users_list(options: &GlobalOptions, as_json: bool) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    let mut users = session.engine.cache().users();
    users.sort_by(|left, right| left.name.cmp(&right.name));

    if as_json {
        println!("{}", serde_json::to_string_pretty(&users)?);
    } else if users.is_empty() {
        println!("No users registered.");
    } else {
        let groups = session.engine.cache().groups();
        for line in format_user_lines(&users, &groups) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_users_add(options: &GlobalOptions, new_user: NewUser) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    let user = session.engine.create_user(new_user.into_user()).await?;
    println!("{}", user.id);
    print_finish(session.finish().await);
    Ok(())
}

pub async fn run_users_delete(options: &GlobalOptions, id: EntityId) -> Result<(), CliError> {
    let session = Session::open(options, Arc::new(ConsoleObserver::default())).await?;
    session.prepare().await;

    session.engine.delete_user(id).await?;
    println!("Deleted user {id}");
    print_finish(session.finish().await);
    Ok(())
}

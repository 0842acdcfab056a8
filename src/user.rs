//! Types for working with users and groups, and for lowering the process's
//! identity.

use crate::error::{Error, Result};

use log::debug;
use nix::{
    libc::{gid_t, uid_t},
    unistd::{self, Gid, Uid},
};
use std::{
    env,
    ffi::CString,
    fmt::{self, Display, Formatter},
};

/// A value representing a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum User {
    Id(Uid),
    Name(String),
}

impl User {
    /// Looks the user up in the password database by either the UID or name.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemonix::User;
    ///
    /// let user = User::Id(0.into()).get().unwrap();
    /// assert_eq!(user.name, "root");
    /// ```
    pub fn get(&self) -> Result<unistd::User> {
        match self {
            Self::Id(uid) => unistd::User::from_uid(*uid),
            Self::Name(name) => unistd::User::from_name(name),
        }
        .map_err(|err| Error::Privilege(format!("{self}: {err}")))?
        .ok_or_else(|| Error::Privilege(format!("{self} does not exist")))
    }

    /// Returns the numeric UID, consulting the password database only for
    /// names.
    pub fn resolve(&self) -> Result<Uid> {
        match self {
            Self::Id(uid) => Ok(*uid),
            Self::Name(_) => self.get().map(|user| user.uid),
        }
    }
}

impl Display for User {
    /// Formats the value into a human-readable string.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemonix::User;
    ///
    /// let user: User = 0.into();
    /// assert_eq!(user.to_string(), "user with ID (0)");
    ///
    /// let user: User = "root".into();
    /// assert_eq!(user.to_string(), "user 'root'");
    /// ```
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(uid) => write!(f, "user with ID ({uid})"),
            Self::Name(name) => write!(f, "user '{name}'"),
        }
    }
}

impl From<&str> for User {
    /// Parses the string into a `User`.
    ///
    /// If the string is a number, a value of [`Self::Id`] is returned.
    /// Otherwise, a value of [`Self::Name`] is returned. When several
    /// whitespace-separated values are given, only the first is used.
    fn from(value: &str) -> Self {
        let value = first_word(value);

        match value.parse::<uid_t>().ok() {
            Some(uid) => Self::Id(uid.into()),
            None => Self::Name(value.into()),
        }
    }
}

impl From<Uid> for User {
    fn from(value: Uid) -> Self {
        Self::Id(value)
    }
}

impl From<uid_t> for User {
    fn from(value: uid_t) -> Self {
        Self::Id(value.into())
    }
}

/// A value representing a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Group {
    Id(Gid),
    Name(String),
}

impl Group {
    /// Looks the group up by either the GID or name.
    pub fn get(&self) -> Result<unistd::Group> {
        match self {
            Self::Id(gid) => unistd::Group::from_gid(*gid),
            Self::Name(name) => unistd::Group::from_name(name),
        }
        .map_err(|err| Error::Privilege(format!("{self}: {err}")))?
        .ok_or_else(|| Error::Privilege(format!("{self} does not exist")))
    }

    /// Returns the numeric GID, consulting the group database only for names.
    pub fn resolve(&self) -> Result<Gid> {
        match self {
            Self::Id(gid) => Ok(*gid),
            Self::Name(_) => self.get().map(|group| group.gid),
        }
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(gid) => write!(f, "group with ID ({gid})"),
            Self::Name(name) => write!(f, "group '{name}'"),
        }
    }
}

impl From<&str> for Group {
    /// Parses the string into a `Group`.
    ///
    /// If the string is a number, a value of [`Self::Id`] is returned.
    /// Otherwise, a value of [`Self::Name`] is returned. A list such as
    /// `"100 20 24"` selects its first entry.
    fn from(value: &str) -> Self {
        let value = first_word(value);

        match value.parse::<gid_t>().ok() {
            Some(gid) => Self::Id(gid.into()),
            None => Self::Name(value.into()),
        }
    }
}

impl From<Gid> for Group {
    fn from(value: Gid) -> Self {
        Self::Id(value)
    }
}

impl From<gid_t> for Group {
    fn from(value: gid_t) -> Self {
        Self::Id(value.into())
    }
}

fn first_word(value: &str) -> &str {
    value.split_whitespace().next().unwrap_or_default()
}

/// The identities a process should switch to.
///
/// `uid` and `gid` change both the real and the effective id; `euid` and
/// `egid` change only the effective id and are ignored when their real
/// counterpart is present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Privileges {
    pub euid: Option<User>,
    pub egid: Option<Group>,
    pub uid: Option<User>,
    pub gid: Option<Group>,
}

impl Privileges {
    /// Builds privileges from a flat `key, value, key, value, ...` list.
    ///
    /// Recognized keys are `euid`, `egid`, `uid` and `gid`.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemonix::Privileges;
    ///
    /// let privileges = Privileges::from_flat(&["uid", "0", "gid", "0"]).unwrap();
    /// assert!(privileges.uid.is_some());
    ///
    /// assert!(Privileges::from_flat(&["uid"]).is_err());
    /// ```
    pub fn from_flat<S: AsRef<str>>(list: &[S]) -> Result<Self> {
        if list.len() % 2 != 0 {
            return Err(Error::config(format!(
                "odd number of elements ({}) in privilege list",
                list.len()
            )));
        }

        let mut privileges = Self::default();

        for pair in list.chunks_exact(2) {
            privileges.set(pair[0].as_ref(), pair[1].as_ref())?;
        }

        Ok(privileges)
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "euid" => self.euid = Some(value.into()),
            "egid" => self.egid = Some(value.into()),
            "uid" => self.uid = Some(value.into()),
            "gid" => self.gid = Some(value.into()),
            _ => {
                return Err(Error::config(format!(
                    "unknown privilege key '{key}'"
                )));
            }
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.euid.is_none()
            && self.egid.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
    }

    /// Sets the current process's user and group.
    ///
    /// Groups are always changed before users: once the user ID has been
    /// lowered, the process may no longer be permitted to change its group.
    pub fn drop_privileges(&self) -> Result<()> {
        if let Some(group) = &self.gid {
            let gid = group.resolve()?;

            if let Some(user) = &self.uid {
                init_groups(user, gid)?;
            }

            unistd::setgid(gid).map_err(|err| {
                Error::Privilege(format!("failed to set group to {group}: {err}"))
            })?;
            unistd::setegid(gid).map_err(|err| {
                Error::Privilege(format!(
                    "failed to set effective group to {group}: {err}"
                ))
            })?;

            debug!("group set to {gid}");
        } else if let Some(group) = &self.egid {
            let gid = group.resolve()?;

            unistd::setegid(gid).map_err(|err| {
                Error::Privilege(format!(
                    "failed to set effective group to {group}: {err}"
                ))
            })?;

            debug!("effective group set to {gid}");
        }

        if let Some(user) = &self.uid {
            let uid = user.resolve()?;

            unistd::setuid(uid).map_err(|err| {
                Error::Privilege(format!("failed to set user to {user}: {err}"))
            })?;
            unistd::seteuid(uid).map_err(|err| {
                Error::Privilege(format!(
                    "failed to set effective user to {user}: {err}"
                ))
            })?;

            if let Ok(Some(entry)) = unistd::User::from_uid(uid) {
                set_env(&entry);
            }

            debug!("user set to {uid}");
        } else if let Some(user) = &self.euid {
            let uid = user.resolve()?;

            unistd::seteuid(uid).map_err(|err| {
                Error::Privilege(format!(
                    "failed to set effective user to {user}: {err}"
                ))
            })?;

            debug!("effective user set to {uid}");
        }

        Ok(())
    }
}

impl From<&str> for Privileges {
    /// Parses the string into `Privileges`.
    ///
    /// The string may consist of a numeric UID, a user name, or a user and
    /// group separated by a colon. Both become real and effective ids.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemonix::{Group, Privileges, User};
    ///
    /// let privileges = Privileges::from("1000");
    /// assert_eq!(privileges.uid, Some(User::Id(1000.into())));
    /// assert!(privileges.gid.is_none());
    ///
    /// let privileges = Privileges::from("myuser:mygroup");
    /// assert_eq!(privileges.uid, Some(User::Name("myuser".into())));
    /// assert_eq!(privileges.gid, Some(Group::Name("mygroup".into())));
    /// ```
    fn from(value: &str) -> Self {
        let mut values = value.trim().splitn(2, ':');

        let user = values.next().unwrap_or_default();
        let group = values.next();

        Self {
            uid: Some(user.into()),
            gid: group.map(|group| group.into()),
            ..Default::default()
        }
    }
}

impl<U, G> From<(U, G)> for Privileges
where
    U: Into<User>,
    G: Into<Group>,
{
    fn from((user, group): (U, G)) -> Self {
        Self {
            uid: Some(user.into()),
            gid: Some(group.into()),
            ..Default::default()
        }
    }
}

/// Drops privileges as described by `privileges`.
pub fn drop_privileges(privileges: &Privileges) -> Result<()> {
    privileges.drop_privileges()
}

// Only root may replace the supplementary group list; anyone else keeps
// theirs.
fn init_groups(user: &User, gid: Gid) -> Result<()> {
    if !Uid::effective().is_root() {
        return Ok(());
    }

    let user = user.get()?;

    let name = CString::new(user.name.as_str()).map_err(|_| {
        Error::Privilege(format!("invalid user name '{}'", user.name))
    })?;

    unistd::initgroups(&name, gid).map_err(|err| {
        Error::Privilege(format!(
            "failed to set supplementary group list for user '{}': {err}",
            user.name
        ))
    })
}

fn set_env(user: &unistd::User) {
    // SAFETY: called during daemonization, before any threads are started.
    unsafe { env::set_var("USER", &user.name) };
    unsafe { env::set_var("HOME", &user.dir) };
    unsafe { env::set_var("SHELL", &user.shell) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_uid() {
        let user: User = "0".into();

        assert_eq!(User::Id(Uid::from_raw(0)), user);
    }

    #[test]
    fn user_name() {
        let user: User = "root".into();

        assert_eq!(User::Name("root".into()), user);
    }

    #[test]
    fn user_get() {
        let user: User = 0.into();
        let user = user.get().unwrap();

        assert!(user.uid.is_root());
        assert_eq!("root", user.name);
    }

    #[test]
    fn user_resolve_name() {
        let user: User = "root".into();

        assert!(user.resolve().unwrap().is_root());
    }

    #[test]
    fn user_resolve_missing() {
        let user: User = "no-such-user-here".into();

        assert!(matches!(user.resolve(), Err(Error::Privilege(_))));
    }

    #[test]
    fn group_list_takes_first() {
        let group: Group = "100 20 24".into();

        assert_eq!(Group::Id(Gid::from_raw(100)), group);
    }

    #[test]
    fn group_get() {
        let group: Group = 0.into();
        let group = group.get().unwrap();

        assert_eq!(0, group.gid.as_raw());
    }

    #[test]
    fn privileges_numeric() {
        let Privileges { uid, gid, .. } = "0:0".into();

        assert_eq!(Some(User::Id(0.into())), uid);
        assert_eq!(Some(Group::Id(0.into())), gid);
    }

    #[test]
    fn privileges_mixed() {
        let Privileges { uid, gid, .. } = "root:0".into();

        assert_eq!(Some(User::Name("root".into())), uid);
        assert_eq!(Some(Group::Id(0.into())), gid);
    }

    #[test]
    fn privileges_user_only() {
        let Privileges { uid, gid, .. } = "root".into();

        assert_eq!(Some(User::Name("root".into())), uid);
        assert!(gid.is_none());
    }

    #[test]
    fn flat_odd_length() {
        let err = Privileges::from_flat(&["uid", "0", "gid"]).unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn flat_unknown_key() {
        let err = Privileges::from_flat(&["user", "root"]).unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn flat_all_keys() {
        let privileges = Privileges::from_flat(&[
            "euid", "1", "egid", "2", "uid", "3", "gid", "4",
        ])
        .unwrap();

        assert_eq!(Some(User::Id(1.into())), privileges.euid);
        assert_eq!(Some(Group::Id(2.into())), privileges.egid);
        assert_eq!(Some(User::Id(3.into())), privileges.uid);
        assert_eq!(Some(Group::Id(4.into())), privileges.gid);
    }

    #[test]
    fn drop_to_current_ids() {
        let uid = Uid::current().as_raw().to_string();
        let gid = Gid::current().as_raw().to_string();
        let euid = Uid::effective().as_raw().to_string();
        let egid = Gid::effective().as_raw().to_string();

        let effective = Privileges::from_flat(&[
            "euid",
            euid.as_str(),
            "egid",
            egid.as_str(),
        ])
        .unwrap();
        drop_privileges(&effective).unwrap();

        if uid == euid && gid == egid {
            let real = Privileges::from_flat(&[
                "uid",
                uid.as_str(),
                "gid",
                gid.as_str(),
            ])
            .unwrap();
            drop_privileges(&real).unwrap();
        }
    }
}

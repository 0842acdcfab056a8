use crate::{
    fork::ForkCount,
    user::{Group, Privileges, User},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Ids may be written either as numbers or as strings; strings that are not
// numbers are names.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Id(u32),
    Name(String),
}

impl<'de> Deserialize<'de> for User {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match IdRepr::deserialize(deserializer)? {
            IdRepr::Id(uid) => uid.into(),
            IdRepr::Name(name) => name.as_str().into(),
        })
    }
}

impl Serialize for User {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Id(uid) => serializer.serialize_u32(uid.as_raw()),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match IdRepr::deserialize(deserializer)? {
            IdRepr::Id(gid) => gid.into(),
            IdRepr::Name(name) => name.as_str().into(),
        })
    }
}

impl Serialize for Group {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Id(gid) => serializer.serialize_u32(gid.as_raw()),
            Self::Name(name) => serializer.serialize_str(name),
        }
    }
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct Ids {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    euid: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    egid: Option<Group>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gid: Option<Group>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PrivilegesRepr {
    Text(String),
    Ids(Ids),
}

impl<'de> Deserialize<'de> for Privileges {
    /// Accepts either a `"user[:group]"` string or a map with any of the keys
    /// `euid`, `egid`, `uid` and `gid`.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match PrivilegesRepr::deserialize(deserializer)? {
            PrivilegesRepr::Text(text) => text.as_str().into(),
            PrivilegesRepr::Ids(Ids {
                euid,
                egid,
                uid,
                gid,
            }) => Self {
                euid,
                egid,
                uid,
                gid,
            },
        })
    }
}

impl Serialize for Privileges {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Ids {
            euid: self.euid.clone(),
            egid: self.egid.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ForkCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u32::deserialize(deserializer).map(ForkCount::new)
    }
}

impl Serialize for ForkCount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.get())
    }
}

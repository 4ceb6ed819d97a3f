use anyhow::Context;
use nix::unistd::{setgid, setuid, Gid, Uid, User};

/// A username resolved against the host user database.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

pub fn resolve(username: &str) -> anyhow::Result<ResolvedUser> {
    let user = User::from_name(username)
        .with_context(|| format!("reading user database entry for {username}"))?
        .ok_or_else(|| anyhow::anyhow!("user {username} does not exist on this host"))?;
    Ok(ResolvedUser {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
    })
}

/// Drop the calling process to the resolved identity. Runs in the
/// child between fork and exec; group first, then user, since setgid
/// is no longer permitted once the uid has been dropped.
pub fn apply(uid: Uid, gid: Gid) -> std::io::Result<()> {
    setgid(gid).map_err(std::io::Error::from)?;
    setuid(uid).map_err(std::io::Error::from)?;
    Ok(())
}

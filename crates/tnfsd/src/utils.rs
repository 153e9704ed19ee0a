use {
    nix::unistd::{Gid, Group, Uid, User},
    std::{fs::Metadata, io, os::unix::prelude::*},
    tnfs::{error::Error, fcall::*, io_err},
};

pub fn stat_from_attr(attr: &Metadata) -> Stat {
    Stat {
        mode: attr.mode() as u16,
        uid: attr.uid() as u16,
        gid: attr.gid() as u16,
        size: attr.len().min(u32::MAX as u64) as u32,
        atime: epoch_secs(attr.atime()),
        mtime: epoch_secs(attr.mtime()),
        ctime: epoch_secs(attr.ctime()),
        ..Default::default()
    }
}

fn epoch_secs(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

/// Owner and group names, empty when the ids have no entry.
pub fn owner_names(uid: u32, gid: u32) -> (String, String) {
    let user = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name);
    let group = Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name);
    (user.unwrap_or_default(), group.unwrap_or_default())
}

pub fn kilobytes(blocks: u64, block_size: u64) -> u32 {
    (blocks.saturating_mul(block_size) / 1024).min(u32::MAX as u64) as u32
}

/// Split a `name:password` argument.
pub fn parse_user(arg: &str) -> tnfs::Result<(&str, &str)> {
    match arg.split_once(':') {
        Some((name, password)) if !name.is_empty() => Ok((name, password)),
        _ => Err(Error::from(io_err!(
            InvalidInput,
            format!("expected name:password, got {:?}", arg)
        ))),
    }
}

pub fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(io::Error::other(e))
}

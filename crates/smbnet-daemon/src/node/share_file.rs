//! Regular files inside a share

use tracing::trace;

use smbnet_core::{FileAttr, FsError, FsResult, OpenFlags, SetAttr};

use super::{share, FileCookie, FileState, FsNode, NodeHandle};
use crate::remote::RemoteFile;
use crate::volume::Volume;

pub(crate) struct ShareFileNode<'v> {
    volume: &'v Volume,
    handle: NodeHandle,
}

impl<'v> ShareFileNode<'v> {
    pub(crate) fn new(volume: &'v Volume, handle: NodeHandle) -> Self {
        Self { volume, handle }
    }
}

fn remote_file(cookie: &FileCookie) -> FsResult<RemoteFile> {
    match cookie.state {
        FileState::ShareFile { file: Some(file) } => Ok(file),
        _ => Err(FsError::BadHandle),
    }
}

fn checked_offset(offset: i64) -> FsResult<u64> {
    u64::try_from(offset).map_err(|_| FsError::InvalidArgument)
}

impl FsNode for ShareFileNode<'_> {
    fn read_stat(&self) -> FsResult<FileAttr> {
        share::read_stat(self.volume, &self.handle)
    }

    fn write_stat(&self, changes: &SetAttr) -> FsResult<()> {
        share::write_stat(self.volume, &self.handle, changes)
    }

    fn open(&self, flags: OpenFlags) -> FsResult<FileCookie> {
        if flags.writes() && self.volume.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let file = self.volume.remote().open(&self.handle.url, flags)?;
        trace!("open {} -> {:?}", self.handle.url, file);
        Ok(FileCookie::new(
            self.handle.id,
            FileState::ShareFile { file: Some(file) },
        ))
    }

    fn close(&self, cookie: &mut FileCookie) -> FsResult<()> {
        if let FileState::ShareFile { file } = &mut cookie.state {
            if let Some(file) = file.take() {
                self.volume.remote().close(file)?;
            }
        }
        Ok(())
    }

    fn free_cookie(&self, cookie: FileCookie) -> FsResult<()> {
        if let FileState::ShareFile { file: Some(file) } = cookie.state {
            let mut remote = self.volume.remote();
            share::close_quietly(&mut remote, &self.handle.url, file);
        }
        Ok(())
    }

    fn read(&self, cookie: &mut FileCookie, offset: i64, size: usize) -> FsResult<Vec<u8>> {
        let offset = checked_offset(offset)?;
        let file = remote_file(cookie)?;

        let mut remote = self.volume.remote();
        remote.seek(file, offset)?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = remote.read(file, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, cookie: &mut FileCookie, offset: i64, data: &[u8]) -> FsResult<usize> {
        let offset = checked_offset(offset)?;
        let file = remote_file(cookie)?;
        if self.volume.is_read_only() {
            return Err(FsError::ReadOnly);
        }

        let mut remote = self.volume.remote();
        remote.seek(file, offset)?;

        let mut written = 0;
        while written < data.len() {
            let n = remote.write(file, &data[written..])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }
}

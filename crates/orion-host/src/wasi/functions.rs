//! WASI syscall bodies
//!
//! Each function works on a [`WasiCtx`] and a [`GuestMemory`] view so it can
//! be exercised without a wasmtime store. The linker glue in `mod.rs` only
//! resolves the memory export and converts the result to a raw errno.

use tracing::debug;

use super::WasiCtx;
use super::errno::Errno;
use super::memory::{GuestMemory, GuestPtr};
use crate::sink::Stream;

pub type WasiResult = Result<(), Errno>;

/// Gather all iovecs into one buffer and append it to the sink in a single
/// write, so a failing call leaves nothing half-written.
///
/// Every buffer is bounds-checked and the total is charged against the run's
/// output budget before any byte is copied.
pub fn fd_write(
    ctx: &mut WasiCtx,
    mem: &mut GuestMemory<'_>,
    fd: u32,
    iovs: GuestPtr,
    iovs_len: u32,
    nwritten: GuestPtr,
) -> WasiResult {
    let stream = Stream::from_fd(fd).ok_or(Errno::Badf)?;

    let iovs = mem.iovecs(iovs, iovs_len)?;
    let total = iovs
        .iter()
        .try_fold(0u32, |acc, iov| acc.checked_add(iov.len))
        .ok_or(Errno::Overflow)?;
    mem.read(nwritten, 4)?;
    ctx.charge_output(total)?;

    let mut buf = Vec::with_capacity(total as usize);
    for iov in &iovs {
        buf.extend_from_slice(mem.read(iov.buf, iov.len)?);
    }
    mem.write_u32(nwritten, total)?;

    debug!(fd, bytes = total, "fd_write");
    if !buf.is_empty() {
        ctx.sink.write(stream, &buf);
    }
    Ok(())
}

/// Only fd 0 is readable. Reads past the end of stdin return 0 bytes.
///
/// Stdin is consumed only once every iovec and `nread` are known to be in
/// bounds.
pub fn fd_read(
    ctx: &mut WasiCtx,
    mem: &mut GuestMemory<'_>,
    fd: u32,
    iovs: GuestPtr,
    iovs_len: u32,
    nread: GuestPtr,
) -> WasiResult {
    if fd != 0 {
        return Err(Errno::Badf);
    }

    let iovs = mem.iovecs(iovs, iovs_len)?;
    mem.read(nread, 4)?;

    let mut total: u32 = 0;
    for iov in &iovs {
        let remaining = &ctx.stdin[ctx.stdin_pos..];
        if remaining.is_empty() {
            break;
        }
        let n = remaining.len().min(iov.len as usize);
        mem.read_mut(iov.buf, n as u32)?
            .copy_from_slice(&remaining[..n]);
        ctx.stdin_pos += n;
        total = total.checked_add(n as u32).ok_or(Errno::Overflow)?;
    }
    mem.write_u32(nread, total)?;

    debug!(fd, bytes = total, "fd_read");
    Ok(())
}

/// Byte count of a NUL-terminated string table.
fn table_size(entries: &[String]) -> Result<u32, Errno> {
    let size: usize = entries.iter().map(|e| e.len() + 1).sum();
    u32::try_from(size).map_err(|_| Errno::Overflow)
}

fn sizes_get(
    entries: &[String],
    mem: &mut GuestMemory<'_>,
    count_ptr: GuestPtr,
    buf_size_ptr: GuestPtr,
) -> WasiResult {
    let count = u32::try_from(entries.len()).map_err(|_| Errno::Overflow)?;
    mem.write_u32(count_ptr, count)?;
    mem.write_u32(buf_size_ptr, table_size(entries)?)?;
    Ok(())
}

/// Write the pointer table at `ptrs` and the strings, each NUL-terminated,
/// back to back from `buf`.
fn table_get(
    entries: &[String],
    mem: &mut GuestMemory<'_>,
    ptrs: GuestPtr,
    buf: GuestPtr,
) -> WasiResult {
    let mut cursor = buf;
    for (i, entry) in entries.iter().enumerate() {
        let slot = (i as u32)
            .checked_mul(4)
            .and_then(|off| ptrs.offset(off))
            .ok_or(Errno::Fault)?;
        mem.write_u32(slot, cursor.0)?;

        mem.write_bytes(cursor, entry.as_bytes())?;
        let nul = cursor
            .offset(entry.len() as u32)
            .ok_or(Errno::Fault)?;
        mem.write_bytes(nul, &[0])?;
        cursor = nul.offset(1).ok_or(Errno::Fault)?;
    }
    Ok(())
}

pub fn args_sizes_get(
    ctx: &WasiCtx,
    mem: &mut GuestMemory<'_>,
    argc: GuestPtr,
    argv_buf_size: GuestPtr,
) -> WasiResult {
    sizes_get(&ctx.args, mem, argc, argv_buf_size)
}

pub fn args_get(
    ctx: &WasiCtx,
    mem: &mut GuestMemory<'_>,
    argv: GuestPtr,
    argv_buf: GuestPtr,
) -> WasiResult {
    table_get(&ctx.args, mem, argv, argv_buf)
}

pub fn environ_sizes_get(
    ctx: &WasiCtx,
    mem: &mut GuestMemory<'_>,
    count: GuestPtr,
    buf_size: GuestPtr,
) -> WasiResult {
    sizes_get(&ctx.env, mem, count, buf_size)
}

pub fn environ_get(
    ctx: &WasiCtx,
    mem: &mut GuestMemory<'_>,
    environ: GuestPtr,
    environ_buf: GuestPtr,
) -> WasiResult {
    table_get(&ctx.env, mem, environ, environ_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::wasi::ImportBinding;
    use std::sync::Arc;

    fn ctx_with(sink: Arc<MemorySink>, args: &[&str], env: &[(&str, &str)]) -> WasiCtx {
        ImportBinding::build(
            sink,
            args.iter().copied(),
            env.iter().map(|(k, v)| (*k, *v)),
        )
        .into_ctx()
    }

    fn put_iovec(mem: &mut GuestMemory<'_>, at: u32, buf: u32, len: u32) {
        mem.write_u32(GuestPtr(at), buf).unwrap();
        mem.write_u32(GuestPtr(at + 4), len).unwrap();
    }

    #[test]
    fn test_fd_write_concatenates_iovecs() {
        let sink = MemorySink::shared();
        let mut ctx = ctx_with(sink.clone(), &[], &[]);
        let mut data = vec![0u8; 256];
        let mut mem = GuestMemory::new(&mut data);

        mem.write_bytes(GuestPtr(100), b"hello").unwrap();
        mem.write_bytes(GuestPtr(120), b" world").unwrap();
        put_iovec(&mut mem, 0, 100, 5);
        put_iovec(&mut mem, 8, 120, 6);

        fd_write(&mut ctx, &mut mem, 1, GuestPtr(0), 2, GuestPtr(64)).unwrap();

        assert_eq!(mem.read_u32(GuestPtr(64)).unwrap(), 11);
        assert_eq!(sink.snapshot().stdout_string(), "hello world");
        assert!(sink.snapshot().stderr.is_empty());
    }

    #[test]
    fn test_fd_write_routes_stderr() {
        let sink = MemorySink::shared();
        let mut ctx = ctx_with(sink.clone(), &[], &[]);
        let mut data = vec![0u8; 64];
        let mut mem = GuestMemory::new(&mut data);
        mem.write_bytes(GuestPtr(32), b"err").unwrap();
        put_iovec(&mut mem, 0, 32, 3);

        fd_write(&mut ctx, &mut mem, 2, GuestPtr(0), 1, GuestPtr(16)).unwrap();
        assert_eq!(sink.snapshot().stderr, b"err");
    }

    #[test]
    fn test_fd_write_bad_fd() {
        let sink = MemorySink::shared();
        let mut ctx = ctx_with(sink.clone(), &[], &[]);
        let mut data = vec![0u8; 64];
        let mut mem = GuestMemory::new(&mut data);

        for fd in [0, 3, 42] {
            assert_eq!(
                fd_write(&mut ctx, &mut mem, fd, GuestPtr(0), 0, GuestPtr(16)),
                Err(Errno::Badf)
            );
        }
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn test_fd_write_fault_writes_nothing() {
        let sink = MemorySink::shared();
        let mut ctx = ctx_with(sink.clone(), &[], &[]);
        let mut data = vec![0u8; 64];
        let mut mem = GuestMemory::new(&mut data);
        mem.write_bytes(GuestPtr(32), b"ok").unwrap();
        put_iovec(&mut mem, 0, 32, 2);
        put_iovec(&mut mem, 8, 60, 100);

        assert_eq!(
            fd_write(&mut ctx, &mut mem, 1, GuestPtr(0), 2, GuestPtr(16)),
            Err(Errno::Fault)
        );
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn test_fd_write_repeated_region_hits_output_budget() {
        let sink = MemorySink::shared();
        let mut ctx = ImportBinding::build(sink.clone(), Vec::<String>::new(), Vec::<(String, String)>::new())
            .with_output_limit(Some(64 * 1024))
            .into_ctx();
        let mut data = vec![0u8; 64 * 1024];
        let mut mem = GuestMemory::new(&mut data);
        // 1000 iovecs all covering the whole of memory
        for i in 0..1000 {
            put_iovec(&mut mem, i * 8, 0, 64 * 1024);
        }

        assert_eq!(
            fd_write(&mut ctx, &mut mem, 1, GuestPtr(0), 1000, GuestPtr(8000)),
            Err(Errno::Fbig)
        );
        assert!(sink.snapshot().is_empty());

        // The budget was not spent by the refused call.
        put_iovec(&mut mem, 0, 0, 16);
        fd_write(&mut ctx, &mut mem, 1, GuestPtr(0), 1, GuestPtr(8000)).unwrap();
        assert_eq!(sink.snapshot().stdout.len(), 16);
    }

    #[test]
    fn test_fd_write_too_many_iovecs() {
        let sink = MemorySink::shared();
        let mut ctx = ctx_with(sink.clone(), &[], &[]);
        let mut data = vec![0u8; 64 * 1024];
        let mut mem = GuestMemory::new(&mut data);

        assert_eq!(
            fd_write(&mut ctx, &mut mem, 1, GuestPtr(0), 8000, GuestPtr(0)),
            Err(Errno::Inval)
        );
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn test_fd_read_fault_keeps_stdin() {
        let sink = MemorySink::shared();
        let mut ctx = ImportBinding::build(sink, Vec::<String>::new(), Vec::<(String, String)>::new())
            .with_stdin(b"abcdef".to_vec())
            .into_ctx();
        let mut data = vec![0u8; 128];
        let mut mem = GuestMemory::new(&mut data);
        put_iovec(&mut mem, 0, 64, 2);
        put_iovec(&mut mem, 8, 120, 16);

        assert_eq!(
            fd_read(&mut ctx, &mut mem, 0, GuestPtr(0), 2, GuestPtr(32)),
            Err(Errno::Fault)
        );
        assert_eq!(mem.read(GuestPtr(64), 2).unwrap(), &[0, 0]);

        put_iovec(&mut mem, 8, 80, 16);
        fd_read(&mut ctx, &mut mem, 0, GuestPtr(0), 2, GuestPtr(32)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(32)).unwrap(), 6);
        assert_eq!(mem.read(GuestPtr(64), 2).unwrap(), b"ab");
        assert_eq!(mem.read(GuestPtr(80), 4).unwrap(), b"cdef");
    }

    #[test]
    fn test_fd_read_stdin() {
        let sink = MemorySink::shared();
        let mut ctx = ImportBinding::build(sink, Vec::<String>::new(), Vec::<(String, String)>::new())
            .with_stdin(b"abcdef".to_vec())
            .into_ctx();
        let mut data = vec![0u8; 128];
        let mut mem = GuestMemory::new(&mut data);
        put_iovec(&mut mem, 0, 64, 4);

        fd_read(&mut ctx, &mut mem, 0, GuestPtr(0), 1, GuestPtr(32)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(32)).unwrap(), 4);
        assert_eq!(mem.read(GuestPtr(64), 4).unwrap(), b"abcd");

        fd_read(&mut ctx, &mut mem, 0, GuestPtr(0), 1, GuestPtr(32)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(32)).unwrap(), 2);
        assert_eq!(mem.read(GuestPtr(64), 2).unwrap(), b"ef");

        fd_read(&mut ctx, &mut mem, 0, GuestPtr(0), 1, GuestPtr(32)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(32)).unwrap(), 0);

        assert_eq!(
            fd_read(&mut ctx, &mut mem, 1, GuestPtr(0), 1, GuestPtr(32)),
            Err(Errno::Badf)
        );
    }

    #[test]
    fn test_args_tables() {
        let sink = MemorySink::shared();
        let ctx = ctx_with(sink, &["prog", "-v"], &[]);
        let mut data = vec![0u8; 128];
        let mut mem = GuestMemory::new(&mut data);

        args_sizes_get(&ctx, &mut mem, GuestPtr(0), GuestPtr(4)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(0)).unwrap(), 2);
        assert_eq!(mem.read_u32(GuestPtr(4)).unwrap(), 8);

        args_get(&ctx, &mut mem, GuestPtr(16), GuestPtr(64)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(16)).unwrap(), 64);
        assert_eq!(mem.read_u32(GuestPtr(20)).unwrap(), 69);
        assert_eq!(mem.read(GuestPtr(64), 8).unwrap(), b"prog\0-v\0");
    }

    #[test]
    fn test_environ_tables() {
        let sink = MemorySink::shared();
        let ctx = ctx_with(sink, &[], &[("HOME", "/"), ("A", "b")]);
        let mut data = vec![0u8; 128];
        let mut mem = GuestMemory::new(&mut data);

        environ_sizes_get(&ctx, &mut mem, GuestPtr(0), GuestPtr(4)).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(0)).unwrap(), 2);
        assert_eq!(mem.read_u32(GuestPtr(4)).unwrap(), 11);

        environ_get(&ctx, &mut mem, GuestPtr(16), GuestPtr(64)).unwrap();
        assert_eq!(mem.read(GuestPtr(64), 11).unwrap(), b"HOME=/\0A=b\0");
    }

    #[test]
    fn test_args_get_buffer_fault() {
        let sink = MemorySink::shared();
        let ctx = ctx_with(sink, &["a-very-long-argument"], &[]);
        let mut data = vec![0u8; 32];
        let mut mem = GuestMemory::new(&mut data);
        assert_eq!(
            args_get(&ctx, &mut mem, GuestPtr(0), GuestPtr(24)),
            Err(Errno::Fault)
        );
    }
}

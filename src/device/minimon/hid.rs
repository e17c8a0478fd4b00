//! hidraw access for the MiniMon.
//!
//! Before the device streams meaningful reports, the 8-byte secret must be
//! pushed once as a 9-byte feature report (leading report ID zero + key)
//! via the HIDIOCSFEATURE ioctl.

use crate::error::{AppResult, RadmonError};
use std::fs::File;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod ioctl {
    use nix::ioctl_write_buf;

    // From linux/hidraw.h
    const HIDRAW_IOC_MAGIC: u8 = b'H';
    const HIDRAW_SET_FEATURE: u8 = 0x06;

    ioctl_write_buf!(
        hidraw_ioc_set_feature,
        HIDRAW_IOC_MAGIC,
        HIDRAW_SET_FEATURE,
        u8
    );
}

/// Send the key as a feature report, arming the device for streaming reads.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn arm_device(file: &File, key: &[u8; 8]) -> AppResult<()> {
    use std::os::fd::AsRawFd;

    let mut report = [0u8; 9];
    report[1..].copy_from_slice(key);

    unsafe { ioctl::hidraw_ioc_set_feature(file.as_raw_fd(), &report) }
        .map_err(|errno| RadmonError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn arm_device(_file: &File, _key: &[u8; 8]) -> AppResult<()> {
    Err(RadmonError::Unsupported("MiniMon (hidraw)"))
}

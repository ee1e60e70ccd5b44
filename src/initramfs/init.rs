//! Live-boot `/init` for the patched initramfs.
//!
//! The script is a straight line of [`BootState`]s with two exits to a
//! recovery shell:
//!
//! ```text
//! InstallToolchain → MountVirtualFs → LoadDrivers → WaitForOpticalDevice
//!   → MountOpticalMedia → LocateSquashImage → MountSquashReadOnly
//!   → CreateWritableOverlay → MountOverlayAsNewRoot → MigrateVirtualMounts
//!   → SwitchRoot
//!
//! WaitForOpticalDevice  ── no device after 10 polls ──→ RecoveryShell
//! LocateSquashImage     ── no rootfs.squashfs ───────→ RecoveryShell
//! ```
//!
//! [`InitScript`] renders one shell fragment per state, in state order.
//! [`simulate`] walks the machine against a [`BootEnv`] for testing.

use std::sync::OnceLock;

/// Optical drive the live media appears on.
pub const OPTICAL_DEVICE: &str = "/dev/sr0";
/// Number of one-second polls for the optical drive.
pub const DEVICE_POLL_LIMIT: u32 = 10;
/// Where the live media is mounted.
pub const MEDIA_MOUNT: &str = "/media/cdrom";
/// Compressed root image at the top of the media.
pub const SQUASHFS_IMAGE: &str = "rootfs.squashfs";

/// Modules probed before waiting for the drive; failures are ignored.
pub const BOOT_MODULES: &[&str] = &[
    "loop",
    "squashfs",
    "isofs",
    "sr_mod",
    "cdrom",
    "ata_piix",
    "ahci",
    "virtio_blk",
    "virtio_pci",
    "virtio_scsi",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    DeviceNotFound,
    SquashImageMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    InstallToolchain,
    MountVirtualFs,
    LoadDrivers,
    WaitForOpticalDevice,
    MountOpticalMedia,
    LocateSquashImage,
    MountSquashReadOnly,
    CreateWritableOverlay,
    MountOverlayAsNewRoot,
    MigrateVirtualMounts,
    SwitchRoot,
    RecoveryShell(AbortReason),
}

/// The happy path, in execution order.
pub const BOOT_SEQUENCE: &[BootState] = &[
    BootState::InstallToolchain,
    BootState::MountVirtualFs,
    BootState::LoadDrivers,
    BootState::WaitForOpticalDevice,
    BootState::MountOpticalMedia,
    BootState::LocateSquashImage,
    BootState::MountSquashReadOnly,
    BootState::CreateWritableOverlay,
    BootState::MountOverlayAsNewRoot,
    BootState::MigrateVirtualMounts,
    BootState::SwitchRoot,
];

/// What the boot environment looks like to the init script.
pub trait BootEnv {
    /// Whether a block device node exists.
    fn block_device_present(&mut self, path: &str) -> bool;
    fn sleep_one_second(&mut self);
    /// Whether a regular file exists.
    fn file_present(&mut self, path: &str) -> bool;
}

impl BootState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootState::SwitchRoot | BootState::RecoveryShell(_))
    }

    /// Execute this state against `env` and return the following one.
    ///
    /// Terminal states return themselves.
    pub fn next(self, env: &mut dyn BootEnv) -> BootState {
        use BootState::*;
        match self {
            InstallToolchain => MountVirtualFs,
            MountVirtualFs => LoadDrivers,
            LoadDrivers => WaitForOpticalDevice,
            WaitForOpticalDevice => {
                let mut polls = 0;
                while !env.block_device_present(OPTICAL_DEVICE) && polls < DEVICE_POLL_LIMIT {
                    env.sleep_one_second();
                    polls += 1;
                }
                if env.block_device_present(OPTICAL_DEVICE) {
                    MountOpticalMedia
                } else {
                    RecoveryShell(AbortReason::DeviceNotFound)
                }
            }
            MountOpticalMedia => LocateSquashImage,
            LocateSquashImage => {
                if env.file_present(&format!("{}/{}", MEDIA_MOUNT, SQUASHFS_IMAGE)) {
                    MountSquashReadOnly
                } else {
                    RecoveryShell(AbortReason::SquashImageMissing)
                }
            }
            MountSquashReadOnly => CreateWritableOverlay,
            CreateWritableOverlay => MountOverlayAsNewRoot,
            MountOverlayAsNewRoot => MigrateVirtualMounts,
            MigrateVirtualMounts => SwitchRoot,
            terminal @ (SwitchRoot | RecoveryShell(_)) => terminal,
        }
    }

    /// Shell fragment implementing this state.
    fn fragment(&self) -> String {
        match self {
            BootState::InstallToolchain => "\
/bin/busybox --install -s
export PATH=/usr/bin:/bin:/usr/sbin:/sbin
"
            .to_string(),
            BootState::MountVirtualFs => "\
mount -t devtmpfs devtmpfs /dev
mount -t proc proc /proc
mount -t sysfs sysfs /sys
"
            .to_string(),
            BootState::LoadDrivers => format!(
                "for mod in {}; do\n    modprobe $mod 2>/dev/null\ndone\n",
                BOOT_MODULES.join(" ")
            ),
            BootState::WaitForOpticalDevice => format!(
                "\
echo \"alpiso: waiting for {dev}...\"
i=0
while [ ! -b {dev} ] && [ $i -lt {limit} ]; do
    sleep 1
    i=$((i + 1))
done
if [ ! -b {dev} ]; then
    rescue \"optical device {dev} not found\"
fi
",
                dev = OPTICAL_DEVICE,
                limit = DEVICE_POLL_LIMIT
            ),
            BootState::MountOpticalMedia => format!(
                "mkdir -p {media}\nmount -t iso9660 -o ro {dev} {media}\n",
                media = MEDIA_MOUNT,
                dev = OPTICAL_DEVICE
            ),
            BootState::LocateSquashImage => format!(
                "if [ ! -f {media}/{img} ]; then\n    rescue \"{img} not found on {media}\"\nfi\n",
                media = MEDIA_MOUNT,
                img = SQUASHFS_IMAGE
            ),
            BootState::MountSquashReadOnly => format!(
                "mkdir -p /lower\nmount -t squashfs -o ro,loop {}/{} /lower\n",
                MEDIA_MOUNT, SQUASHFS_IMAGE
            ),
            BootState::CreateWritableOverlay => "\
mkdir -p /upper
mount -t tmpfs tmpfs /upper
mkdir -p /upper/upper /upper/work
"
            .to_string(),
            BootState::MountOverlayAsNewRoot => "\
mkdir -p /sysroot
mount -t overlay overlay \\
    -o lowerdir=/lower,upperdir=/upper/upper,workdir=/upper/work \\
    /sysroot
"
            .to_string(),
            BootState::MigrateVirtualMounts => "\
mkdir -p /sysroot/dev /sysroot/proc /sysroot/sys
mount --move /dev /sysroot/dev
mount --move /proc /sysroot/proc
mount --move /sys /sysroot/sys
"
            .to_string(),
            BootState::SwitchRoot => "\
echo \"alpiso: switching to root filesystem...\"
exec switch_root /sysroot /sbin/init
"
            .to_string(),
            BootState::RecoveryShell(_) => "\
rescue() {
    echo \"alpiso: ERROR: $1\"
    echo \"alpiso: dropping to emergency shell...\"
    exec /bin/sh
}
"
            .to_string(),
        }
    }
}

/// Outcome of walking the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTrace {
    pub states: Vec<BootState>,
    pub seconds_waited: u32,
}

impl BootTrace {
    pub fn final_state(&self) -> Option<BootState> {
        self.states.last().copied()
    }
}

/// Walk the boot sequence against `env` until a terminal state.
pub fn simulate(env: &mut dyn BootEnv) -> BootTrace {
    struct Counting<'a> {
        inner: &'a mut dyn BootEnv,
        seconds: u32,
    }

    impl BootEnv for Counting<'_> {
        fn block_device_present(&mut self, path: &str) -> bool {
            self.inner.block_device_present(path)
        }
        fn sleep_one_second(&mut self) {
            self.seconds += 1;
            self.inner.sleep_one_second();
        }
        fn file_present(&mut self, path: &str) -> bool {
            self.inner.file_present(path)
        }
    }

    let mut env = Counting {
        inner: env,
        seconds: 0,
    };
    let mut state = BootState::InstallToolchain;
    let mut states = vec![state];
    while !state.is_terminal() {
        state = state.next(&mut env);
        states.push(state);
    }
    BootTrace {
        states,
        seconds_waited: env.seconds,
    }
}

/// The rendered `/init` script. Built once, never modified.
#[derive(Debug)]
pub struct InitScript {
    text: String,
}

impl InitScript {
    /// The shared script instance.
    pub fn get() -> &'static InitScript {
        static SCRIPT: OnceLock<InitScript> = OnceLock::new();
        SCRIPT.get_or_init(InitScript::render)
    }

    fn render() -> Self {
        let mut text = String::from("#!/bin/sh\n# alpiso live media init\n\n");
        // The helper must be defined before any state can abort.
        text.push_str(&BootState::RecoveryShell(AbortReason::DeviceNotFound).fragment());
        for state in BOOT_SEQUENCE {
            text.push('\n');
            text.push_str(&state.fragment());
        }
        Self { text }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }
}

// SPDX-License-Identifier: GPL-3.0-only

//! DRM KMS device auto detection.
//!
//! Picks the first `card` node that exposes a usable display pipeline. This
//! is a one-shot probe: nothing is cached and nothing is retried.

use rustix::fs::{Mode, OFlags};
use smithay::{
    backend::drm::DrmDeviceFd,
    reexports::drm::control::Device as ControlDevice,
    utils::DeviceFd,
};
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// A device node found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub syspath: PathBuf,
    pub devnode: Option<PathBuf>,
    pub sysnum: Option<usize>,
}

/// Resource counts of a KMS device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub crtcs: usize,
    pub connectors: usize,
    pub encoders: usize,
}

impl Resources {
    pub fn has_pipeline(&self) -> bool {
        self.crtcs > 0 && self.connectors > 0 && self.encoders > 0
    }
}

/// Source of candidate devices and their resources.
///
/// `Device` is an open handle. It is dropped, and with it closed, before the
/// next candidate is looked at.
pub trait DeviceProbe {
    type Device;

    fn candidates(&self) -> io::Result<Vec<Candidate>>;
    fn open(&self, path: &Path) -> io::Result<Self::Device>;
    fn resources(&self, device: &Self::Device) -> io::Result<Resources>;
}

/// Enumerates `drm` class devices through udev and queries them via KMS.
#[derive(Debug, Default)]
pub struct UdevProbe;

impl DeviceProbe for UdevProbe {
    type Device = DrmDeviceFd;

    fn candidates(&self) -> io::Result<Vec<Candidate>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;

        Ok(enumerator
            .scan_devices()?
            .map(|device| Candidate {
                syspath: device.syspath().to_path_buf(),
                devnode: device.devnode().map(Path::to_path_buf),
                sysnum: device.sysnum(),
            })
            .collect())
    }

    fn open(&self, path: &Path) -> io::Result<DrmDeviceFd> {
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        Ok(DrmDeviceFd::new(DeviceFd::from(fd)))
    }

    fn resources(&self, device: &DrmDeviceFd) -> io::Result<Resources> {
        let handles = device.resource_handles()?;
        Ok(Resources {
            crtcs: handles.crtcs().len(),
            connectors: handles.connectors().len(),
            encoders: handles.encoders().len(),
        })
    }
}

/// Find a DRM KMS device usable for display output.
///
/// Returns `None` if no such device exists. Never fails otherwise.
pub fn detect_drm_device() -> Option<PathBuf> {
    detect_with(&UdevProbe)
}

pub fn detect_with<P: DeviceProbe>(probe: &P) -> Option<PathBuf> {
    info!("Auto detecting DRM KMS device");

    let candidates = match probe.candidates() {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(?err, "Error scanning for udev devices");
            return None;
        }
    };

    for candidate in candidates {
        if let Some(path) = check_candidate(probe, &candidate) {
            info!("Using {}", path.display());
            return Some(path);
        }
    }

    warn!("Could not auto detect DRM device");
    None
}

fn check_candidate<P: DeviceProbe>(probe: &P, candidate: &Candidate) -> Option<PathBuf> {
    let (Some(devnode), Some(_)) = (candidate.devnode.as_ref(), candidate.sysnum) else {
        debug!(syspath = %candidate.syspath.display(), "Skipping device without node");
        return None;
    };

    let device = match probe.open(devnode) {
        Ok(device) => device,
        Err(err) => {
            debug!(?err, "Failed to open {}", devnode.display());
            return None;
        }
    };

    match probe.resources(&device) {
        Ok(resources) if resources.has_pipeline() => Some(devnode.clone()),
        Ok(resources) => {
            debug!(?resources, "{} has no display pipeline", devnode.display());
            None
        }
        Err(err) => {
            debug!(?err, "Failed to get resources of {}", devnode.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    #[derive(Clone)]
    enum Node {
        Unopenable,
        Broken,
        Res(Resources),
    }

    #[derive(Default)]
    struct FakeProbe {
        candidates: Vec<Candidate>,
        nodes: HashMap<PathBuf, Node>,
        open: Rc<RefCell<Vec<PathBuf>>>,
        opened: RefCell<Vec<PathBuf>>,
    }

    struct FakeDevice {
        path: PathBuf,
        node: Node,
        open: Rc<RefCell<Vec<PathBuf>>>,
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.open.borrow_mut().retain(|p| p != &self.path);
        }
    }

    impl FakeProbe {
        fn with(mut self, num: usize, node: Node) -> Self {
            let path = PathBuf::from(format!("/dev/dri/card{}", num));
            self.candidates.push(Candidate {
                syspath: PathBuf::from(format!("/sys/class/drm/card{}", num)),
                devnode: Some(path.clone()),
                sysnum: Some(num),
            });
            self.nodes.insert(path, node);
            self
        }
    }

    impl DeviceProbe for FakeProbe {
        type Device = FakeDevice;

        fn candidates(&self) -> io::Result<Vec<Candidate>> {
            Ok(self.candidates.clone())
        }

        fn open(&self, path: &Path) -> io::Result<FakeDevice> {
            self.opened.borrow_mut().push(path.to_path_buf());
            match self.nodes.get(path).cloned() {
                Some(Node::Unopenable) | None => {
                    Err(io::Error::from(io::ErrorKind::PermissionDenied))
                }
                Some(node) => {
                    self.open.borrow_mut().push(path.to_path_buf());
                    Ok(FakeDevice {
                        path: path.to_path_buf(),
                        node,
                        open: self.open.clone(),
                    })
                }
            }
        }

        fn resources(&self, device: &FakeDevice) -> io::Result<Resources> {
            match device.node {
                Node::Res(res) => Ok(res),
                _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
            }
        }
    }

    fn full() -> Node {
        Node::Res(Resources {
            crtcs: 2,
            connectors: 3,
            encoders: 3,
        })
    }

    #[test]
    fn picks_only_qualifying_device() {
        let probe = FakeProbe::default()
            .with(0, Node::Res(Resources::default()))
            .with(1, full())
            .with(
                2,
                Node::Res(Resources {
                    crtcs: 1,
                    connectors: 0,
                    encoders: 1,
                }),
            );

        assert_eq!(detect_with(&probe), Some(PathBuf::from("/dev/dri/card1")));
        assert!(probe.open.borrow().is_empty());
        // the first hit ends the scan
        assert_eq!(probe.opened.borrow().len(), 2);
    }

    #[test]
    fn none_qualifying_is_empty() {
        for missing in 0..3 {
            let mut res = [1, 1, 1];
            res[missing] = 0;
            let probe = FakeProbe::default().with(0, Node::Broken).with(
                1,
                Node::Res(Resources {
                    crtcs: res[0],
                    connectors: res[1],
                    encoders: res[2],
                }),
            );
            assert_eq!(detect_with(&probe), None);
            assert!(probe.open.borrow().is_empty());
        }
        assert_eq!(detect_with(&FakeProbe::default()), None);
    }

    #[test]
    fn skips_unopenable_device() {
        let probe = FakeProbe::default()
            .with(0, Node::Unopenable)
            .with(1, full());

        assert_eq!(detect_with(&probe), Some(PathBuf::from("/dev/dri/card1")));
        assert!(probe.open.borrow().is_empty());
    }

    #[test]
    fn skips_candidates_without_node_or_number() {
        let mut probe = FakeProbe::default().with(3, full());
        probe.candidates.insert(
            0,
            Candidate {
                syspath: PathBuf::from("/sys/class/drm/card0"),
                devnode: None,
                sysnum: Some(0),
            },
        );
        probe.candidates.insert(
            1,
            Candidate {
                syspath: PathBuf::from("/sys/class/drm/cardX"),
                devnode: Some(PathBuf::from("/dev/dri/card3")),
                sysnum: None,
            },
        );

        assert_eq!(detect_with(&probe), Some(PathBuf::from("/dev/dri/card3")));
        assert_eq!(probe.opened.borrow().len(), 1);
    }
}

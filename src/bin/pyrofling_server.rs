//! The `pyrofling-server` binary (spec §6 "Server CLI"): wires the dispatcher (C4), the streaming
//! server (C9), and the virtual vblank timer (C10) together and runs the event loop.
//!
//! Grounded on `pyro-server/pyro_server.cpp`'s `main()` for the startup sequence (enumerate
//! devices, bind sockets, arm the vblank timer, run) and on spec §9 "cyclic lifecycle" for why the
//! server is constructed in its own `Rc<RefCell<_>>` before the dispatcher ever sees it.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;

use pyrofling::ipc::Dispatcher;
use pyrofling::server::device::{DeviceRegistry, PhysicalDeviceInfo};
use pyrofling::server::tick::TimerFdBackend;
use pyrofling::server::{ServerConfig, StreamingServer, VblankHandler};

/// Real physical-device enumeration needs a live `VkInstance` and `vkEnumeratePhysicalDevices`
/// (spec §1: the Vulkan driver/loader is an out-of-scope collaborator; this binary only drives
/// the IPC/protocol surface). Until a real Vulkan instance is wired in, a single placeholder
/// device lets `Device` messages resolve deterministically instead of every client being
/// rejected outright.
fn enumerate_devices() -> DeviceRegistry {
    DeviceRegistry::new(vec![PhysicalDeviceInfo {
        index: 0,
        name: "placeholder".to_string(),
        device_uuid: [0; 16],
        driver_uuid: [0; 16],
        luid: None,
    }])
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let config = ServerConfig::parse();

    let devices = enumerate_devices();
    for device in devices.devices() {
        log::info!("enumerated device: {device}");
    }

    let period_ns = 1_000_000_000u64 / config.fps.max(1) as u64;

    let mut dispatcher = Dispatcher::new(&config.socket, Some(config.port)).context("failed to initialize dispatcher")?;

    let server = Rc::new(RefCell::new(StreamingServer::new(config, devices)));
    server.borrow_mut().set_self_weak(Rc::downgrade(&server));
    server.borrow_mut().set_udp_native_handle(dispatcher.udp_native_handle());

    let mut timer = TimerFdBackend::new().context("failed to create vblank timer")?;
    timer.arm(period_ns, period_ns).context("failed to arm vblank timer")?;
    let timer_handle = timer.try_clone().context("dup of a freshly created timerfd should not fail")?;

    let vblank_handler: Rc<RefCell<dyn pyrofling::ipc::Handler>> =
        Rc::new(RefCell::new(VblankHandler::new(Rc::downgrade(&server), timer)));
    dispatcher.add_connection(timer_handle, vblank_handler, 0, true, false);

    dispatcher.set_handler_factory(Box::new(server));

    log::info!("pyrofling-server running");
    dispatcher.run();
    Ok(())
}

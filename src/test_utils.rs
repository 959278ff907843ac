pub mod test_helpers {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;
    use url::Url;

    use crate::error::{MapError, Result};
    use crate::executor::TransformHandle;
    use crate::fetch::{FetchLimits, SourceFetcher};
    use crate::host::{HeadlessHost, LiveSurface, SurfaceHost, TickQueue};
    use crate::images::codec;
    use crate::maps::SurfaceId;
    use crate::service::MapService;
    use crate::settings::Settings;

    /// How long tests pump the main thread before giving up
    pub const PUMP_TIMEOUT: Duration = Duration::from_secs(30);

    /// Four coloured quadrants, red/green on top and blue/yellow below
    pub fn quadrant_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| match (x < width / 2, y < height / 2) {
            (true, true) => Rgba([255, 0, 0, 255]),
            (false, true) => Rgba([0, 255, 0, 255]),
            (true, false) => Rgba([0, 0, 255, 255]),
            (false, false) => Rgba([255, 255, 0, 255]),
        })
    }

    pub fn png_bytes(image: &RgbaImage) -> Vec<u8> {
        codec::encode_png(image).unwrap()
    }

    pub fn solid_png(width: u32, height: u32, colour: [u8; 4]) -> Vec<u8> {
        png_bytes(&RgbaImage::from_pixel(width, height, Rgba(colour)))
    }

    /// Serves fixed bytes for known URLs
    #[derive(Default)]
    pub struct StaticFetcher {
        responses: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl StaticFetcher {
        pub fn serve(&self, url: &str, bytes: Vec<u8>) {
            self.responses.lock().unwrap().insert(url.to_string(), bytes);
        }
    }

    impl SourceFetcher for StaticFetcher {
        fn fetch_url(&self, url: &Url, _limits: FetchLimits) -> Result<Vec<u8>> {
            self.responses
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| MapError::InvalidSource(format!("{url} answered with HTTP 404")))
        }
    }

    /// Headless host that starts failing installs after a number of them
    pub struct FlakyHost {
        inner: HeadlessHost,
        installs_left: AtomicUsize,
    }

    impl FlakyHost {
        pub fn failing_after(installs: usize) -> Self {
            Self {
                inner: HeadlessHost::new(),
                installs_left: AtomicUsize::new(installs),
            }
        }

        pub fn headless(&self) -> &HeadlessHost {
            &self.inner
        }
    }

    impl SurfaceHost for FlakyHost {
        fn allocate_surface_id(&self) -> Result<SurfaceId> {
            self.inner.allocate_surface_id()
        }

        fn surface_exists(&self, id: SurfaceId) -> bool {
            self.inner.surface_exists(id)
        }

        fn install_live_surface(&self, id: SurfaceId) -> Result<Box<dyn LiveSurface>> {
            let left = self
                .installs_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_err() {
                return Err(MapError::SurfaceUnavailable(format!(
                    "surface {id} refused by host"
                )));
            }
            self.inner.install_live_surface(id)
        }

        fn release_surface(&self, id: SurfaceId) {
            self.inner.release_surface(id);
        }
    }

    /// A map service over a temporary data directory and a headless host
    pub struct TestEnv<H: SurfaceHost + 'static = HeadlessHost> {
        pub dir: TempDir,
        pub queue: TickQueue,
        pub host: Arc<H>,
        pub fetcher: Arc<StaticFetcher>,
        pub service: MapService,
    }

    impl TestEnv<HeadlessHost> {
        pub fn new() -> Self {
            Self::with_settings(Settings::default())
        }

        pub fn with_settings(settings: Settings) -> Self {
            Self::with_host(settings, HeadlessHost::new())
        }
    }

    impl<H: SurfaceHost + 'static> TestEnv<H> {
        pub fn with_host(settings: Settings, host: H) -> Self {
            let dir = TempDir::new().unwrap();
            Self::in_dir(dir, settings, host)
        }

        /// Open a service over an existing directory, as after a restart
        pub fn in_dir(dir: TempDir, settings: Settings, host: H) -> Self {
            let queue = TickQueue::new();
            let host = Arc::new(host);
            let fetcher = Arc::new(StaticFetcher::default());
            let service = MapService::with_fetcher(
                dir.path(),
                settings,
                host.clone(),
                Arc::new(queue.handle()),
                fetcher.clone(),
            )
            .unwrap();
            Self {
                dir,
                queue,
                host,
                fetcher,
                service,
            }
        }

        /// Pump the main thread until `handle` is finished
        pub fn wait<T: Send + 'static>(&self, handle: TransformHandle<T>) -> Result<T> {
            let finished = self
                .queue
                .pump_until(PUMP_TIMEOUT, || handle.is_finished());
            assert!(finished, "transform did not finish in time");
            // Tasks queued by the job after it finished, such as renderer
            // cleanup, still get to run.
            self.queue.run_pending();
            handle.wait()
        }

        /// Pump until every handle is finished and collect their results
        pub fn wait_all<T: Send + 'static>(&self, handles: Vec<TransformHandle<T>>) -> Vec<Result<T>> {
            let finished = self
                .queue
                .pump_until(PUMP_TIMEOUT, || handles.iter().all(TransformHandle::is_finished));
            assert!(finished, "transforms did not finish in time");
            self.queue.run_pending();
            handles.into_iter().map(TransformHandle::wait).collect()
        }

        /// Shut the service down and hand back the data directory
        pub fn restart_dir(mut self) -> TempDir {
            self.service.shutdown();
            self.dir
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use crate::host::SurfaceHost;

    #[test]
    fn flaky_host_fails_after_budget() {
        let host = FlakyHost::failing_after(1);
        let a = host.allocate_surface_id().unwrap();
        let b = host.allocate_surface_id().unwrap();
        assert!(host.install_live_surface(a).is_ok());
        assert!(host.install_live_surface(b).is_err());
    }

    #[test]
    fn quadrant_image_has_four_colours() {
        let image = quadrant_image(4, 4);
        assert_ne!(image.get_pixel(0, 0), image.get_pixel(3, 0));
        assert_ne!(image.get_pixel(0, 0), image.get_pixel(0, 3));
    }
}

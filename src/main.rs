// =============================================================================
// VULKAN FRAME ENGINE - Application shell
// =============================================================================
//
// The shell owns the window and the event loop; everything Vulkan lives in
// the Engine behind the Renderer trait. Frame flow per redraw:
// 1. Compute dt, advance camera state
// 2. render_frame(): pace -> sync -> acquire -> record -> submit -> present
// 3. Skipped frames (minimized, rebuilding) are Ok(false), fatal errors
//    terminate the loop and the process exits non-zero.

mod backend;
mod config;
mod engine;
mod pacer;
mod scene;

use anyhow::Result;
use config::Config;
use engine::{Engine, Renderer};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting vkframe");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(e) = app.fatal.take() {
        log::error!("Fatal: {:?}", e);
        return Err(e);
    }
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    engine: Option<Engine>,
    is_fullscreen: bool,

    /// First fatal error; stops the loop and is reported from main.
    fatal: Option<anyhow::Error>,

    // FPS tracking
    last_update: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            engine: None,
            is_fullscreen,
            fatal: None,
            last_update: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    fn init_engine(&mut self, window: &Window) -> Result<()> {
        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();
        let size = window.inner_size();

        let engine = Engine::new(
            &self.config,
            display_handle,
            window_handle,
            size.width,
            size.height,
        )?;
        self.engine = Some(engine);
        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The size change arrives as a Resized event
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen {
                    "fullscreen"
                } else {
                    "windowed"
                };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    1000.0 / fps.max(1.0),
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fatal = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_engine(&window) {
            self.fatal = Some(e.context("Failed to initialize renderer"));
            event_loop.exit();
            return;
        }

        self.last_update = Instant::now();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref engine) = self.engine {
                    log::info!("Presented {} frames", engine.submitted_frames());
                    if let Err(e) = engine.wait_idle() {
                        log::error!("Wait idle failed during shutdown: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut engine) = self.engine {
                    engine.on_window_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                let Some(ref mut engine) = self.engine else {
                    return;
                };

                let now = Instant::now();
                let dt = now.duration_since(self.last_update).as_secs_f32();
                self.last_update = now;

                engine.update(dt);
                match engine.render_frame() {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {} // paused or rebuilding
                    Err(e) => {
                        self.fatal = Some(e.context("Render failed"));
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            KeyCode::F10 => {
                                if let Some(ref mut engine) = self.engine {
                                    engine.toggle_frame_cap();
                                }
                            }
                            KeyCode::Space => {
                                if let Some(ref mut engine) = self.engine {
                                    engine.cycle_scene_layout();
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; the engine's pacer controls the rate.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

//! Process signals the daemon and one-shot runs react to.

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    pub struct Listener(Signal);

    impl Listener {
        pub fn hangup() -> std::io::Result<Self> {
            Ok(Self(signal(SignalKind::hangup())?))
        }

        pub fn interrupt() -> std::io::Result<Self> {
            Ok(Self(signal(SignalKind::interrupt())?))
        }

        pub fn terminate() -> std::io::Result<Self> {
            Ok(Self(signal(SignalKind::terminate())?))
        }

        pub async fn recv(&mut self) {
            self.0.recv().await;
        }
    }
}

#[cfg(not(unix))]
mod imp {
    /// Only Ctrl-C exists here; the other kinds never fire.
    pub struct Listener {
        ctrl_c: bool,
    }

    impl Listener {
        pub fn hangup() -> std::io::Result<Self> {
            Ok(Self { ctrl_c: false })
        }

        pub fn interrupt() -> std::io::Result<Self> {
            Ok(Self { ctrl_c: true })
        }

        pub fn terminate() -> std::io::Result<Self> {
            Ok(Self { ctrl_c: false })
        }

        pub async fn recv(&mut self) {
            if self.ctrl_c {
                let _ = tokio::signal::ctrl_c().await;
            } else {
                std::future::pending::<()>().await
            }
        }
    }
}

pub use imp::Listener;
